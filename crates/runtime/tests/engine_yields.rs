mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sluice_common::models::{Determinism, RequestId};
use sluice_connectors::sources::MemoryTable;
use sluice_error::Result;
use sluice_runtime::plan::{
    PlanContext, PlanExecutor, PlanFactory, PlanPoll, PreparedPlan, TupleBatch,
};
use sluice_runtime::{QueryOptions, QueryRequest};

/// Produces integer batches synchronously, taking `pause` per batch.
struct PacedPlan {
    batches: i64,
    batch_size: i64,
    produced: i64,
    pause: Duration,
}

impl PlanExecutor for PacedPlan {
    fn next_batch(&mut self, _context: &mut dyn PlanContext) -> Result<PlanPoll> {
        std::thread::sleep(self.pause);
        let first = self.produced * self.batch_size + 1;
        self.produced += 1;
        Ok(PlanPoll::Batch(TupleBatch {
            rows: int_rows(first, first + self.batch_size - 1),
            last: self.produced == self.batches,
        }))
    }

    fn cancel(&mut self) {}

    fn close(&mut self) {}
}

struct PacedPlanFactory {
    batches: i64,
    batch_size: i64,
    pause: Duration,
}

impl PlanFactory for PacedPlanFactory {
    fn instantiate(&self) -> Result<Box<dyn PlanExecutor>> {
        Ok(Box::new(PacedPlan {
            batches: self.batches,
            batch_size: self.batch_size,
            produced: 0,
            pause: self.pause,
        }))
    }
}

fn with_fetch(sql: &str, fetch_size: u64) -> QueryRequest {
    QueryRequest::new(sql).with_options(QueryOptions {
        fetch_size: Some(fetch_size),
        ..Default::default()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unbounded_window_returns_every_row() -> anyhow::Result<()> {
    let h = Harness::new(test_config())?;
    h.table("t", MemoryTable::new(int_columns(), vec![int_rows(1, 3)]), Determinism::Deterministic, true);
    let id = RequestId::new("s1", 1);

    let first = within(h.engine.submit_request(session("s1"), 1, with_fetch(&scan_sql("t"), u64::MAX))?).await?;
    assert_eq!(first.rows, int_rows(1, 3));
    assert_eq!((first.first_row, first.last_row), (1, 3));
    assert_eq!(first.final_row, Some(3));
    assert!(first.is_last);

    let again = within(h.engine.request_more(&id, 1, u64::MAX)?).await?;
    assert_eq!(again.rows, int_rows(1, 3));
    assert!(again.is_last);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_time_slice_yields_between_batches() -> anyhow::Result<()> {
    let mut config = test_config();
    config.engine.time_slice_ms = 1;
    let h = Harness::new(config)?;
    h.compiler.register(
        "SELECT paced",
        PreparedPlan {
            columns: int_columns(),
            determinism: Determinism::Nondeterministic,
            read_only: true,
            factory: Arc::new(PacedPlanFactory {
                batches: 6,
                batch_size: 5,
                pause: Duration::from_millis(3),
            }),
        },
    );

    let msg = within(h.engine.submit_request(session("s1"), 1, with_fetch("SELECT paced", 100))?).await?;
    assert_eq!(msg.rows, int_rows(1, 30));
    assert!(msg.is_last);

    // Every batch outlives the slice, so each one ends its generation
    wait_until(|| h.engine.snapshot().scheduler.runs >= 6).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_buffer_pauses_until_more_is_requested() -> anyhow::Result<()> {
    let mut config = test_config();
    config.engine.max_buffered_rows = 5;
    let h = Harness::new(config)?;
    let batches = (0..6).map(|b| int_rows(b * 5 + 1, b * 5 + 5)).collect();
    h.table("t", MemoryTable::new(int_columns(), batches), Determinism::Deterministic, true);
    let id = RequestId::new("s1", 1);
    let buffered = || h.engine.snapshot().requests[0].rows_buffered;

    let first = within(h.engine.submit_request(session("s1"), 1, with_fetch(&scan_sql("t"), 5))?).await?;
    assert_eq!(first.rows, int_rows(1, 5));

    // Window end 5 plus 5 buffered rows ahead
    wait_until(|| buffered() == 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(buffered(), 10);
    assert!(!h.engine.snapshot().requests[0].done_producing);

    let second = within(h.engine.request_more(&id, 6, 15)?).await?;
    assert_eq!(second.rows, int_rows(6, 15));
    wait_until(|| buffered() == 20).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(buffered(), 20);

    let rest = within(h.engine.request_more(&id, 16, 30)?).await?;
    assert_eq!(rest.rows, int_rows(16, 30));
    assert!(rest.is_last);
    Ok(())
}
