use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::*;

/// Admits an op that parks the queue and hands its completion to the
/// test, so later admissions demonstrably wait.
fn park_queue(serial: &SerialQueue) -> oneshot::Receiver<Completion> {
    let (gate_tx, gate_rx) = oneshot::channel();
    serial.enqueue_fn(move |done| {
        let _ = gate_tx.send(done);
    });
    gate_rx
}

// ============================================================
// admission order
// ============================================================

#[tokio::test]
async fn test_ops_complete_in_admission_order() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let op = |n: u32, delay: u64| {
        let events = events.clone();
        async move {
            events.lock().unwrap().push(format!("start {n}"));
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            events.lock().unwrap().push(format!("end {n}"));
            n
        }
    };

    // Op 1 is slow; 2 and 3 would complete instantly if allowed to run.
    let (r1, r2, r3) = tokio::join!(
        serial.enqueue(op(1, 30)),
        serial.enqueue(op(2, 0)),
        serial.enqueue(op(3, 0)),
    );
    assert_eq!((r1?, r2?, r3?), (1, 2, 3));
    assert_eq!(
        *events.lock().unwrap(),
        ["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
    );
    Ok(())
}

#[tokio::test]
async fn test_an_op_waits_for_the_running_op() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    let gate = park_queue(&serial).await?;
    assert!(!serial.is_idle());

    let second = serial.enqueue(async { 2 });
    assert_eq!(serial.queued_len(), 1);

    gate.finish();
    assert_eq!(second.await?, 2);
    assert!(serial.is_idle());
    Ok(())
}

#[tokio::test]
async fn test_idle_queue_runs_immediately() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    assert!(serial.is_idle());
    assert_eq!(serial.timeout_millis(), DEFAULT_TIMEOUT_MILLIS);
    assert_eq!(serial.enqueue(async { 42 }).await?, 42);
    Ok(())
}

#[tokio::test]
async fn test_thousand_synchronous_completions_unwind_without_overflow() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    let gate = park_queue(&serial).await?;

    let ran: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let (last_tx, last_rx) = oneshot::channel();
    let mut last_tx = Some(last_tx);
    for n in 0..1000 {
        let ran = ran.clone();
        let last_tx = if n == 999 { last_tx.take() } else { None };
        serial.enqueue_fn(move |done| {
            ran.lock().unwrap().push(n);
            if let Some(tx) = last_tx {
                let _ = tx.send(());
            }
            done.finish();
        });
    }
    assert_eq!(serial.queued_len(), 1000);

    gate.finish();
    last_rx.await?;
    assert!(ran.lock().unwrap().iter().copied().eq(0..1000));
    while !serial.is_idle() {
        tokio::task::yield_now().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_double_finish_does_not_skip_ahead() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    let gate = park_queue(&serial).await?;
    let ran: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    serial.enqueue_fn({
        let ran = ran.clone();
        move |done| {
            ran.lock().unwrap().push("double");
            done.finish();
            done.finish();
        }
    });
    let (hold_tx, hold_rx) = oneshot::channel();
    serial.enqueue_fn({
        let ran = ran.clone();
        move |done| {
            ran.lock().unwrap().push("held");
            let _ = hold_tx.send(done);
        }
    });
    serial.enqueue_fn({
        let ran = ran.clone();
        move |done| {
            ran.lock().unwrap().push("tail");
            done.finish();
        }
    });

    gate.finish();
    let held = hold_rx.await?;
    // The duplicate finish must not have started "tail" while "held"
    // still runs.
    assert_eq!(*ran.lock().unwrap(), ["double", "held"]);

    held.finish();
    assert!(serial.is_idle());
    assert_eq!(*ran.lock().unwrap(), ["double", "held", "tail"]);
    Ok(())
}

// ============================================================
// timeout
// ============================================================

#[tokio::test]
async fn test_timeout_fails_the_caller_and_advances() {
    let serial = SerialQueue::with_timeout_millis(20);
    let stalled = serial.enqueue(futures::future::pending::<()>());
    let after = serial.enqueue(async { "ran" });
    assert_eq!(stalled.await, Err(SerialError::TimedOut(20)));
    assert_eq!(after.await, Ok("ran"));
}

#[tokio::test]
async fn test_late_completion_after_timeout_is_a_no_op() -> anyhow::Result<()> {
    let serial = SerialQueue::with_timeout_millis(20);
    let slow = serial.enqueue(async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        "late"
    });
    assert_eq!(slow.await, Err(SerialError::TimedOut(20)));

    // The queue advanced while the timed-out op is still in flight.
    let next = serial.enqueue(async { "next" });
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(20), next).await?,
        Ok("next")
    );

    // Let the late completion land on its guarded handle.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(serial.is_idle());
    Ok(())
}

#[tokio::test]
async fn test_zero_timeout_disables_the_deadline() {
    let serial = SerialQueue::with_timeout_millis(0);
    let slow = serial.enqueue(async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        "done"
    });
    assert_eq!(slow.await, Ok("done"));
}

#[tokio::test]
async fn test_per_op_timeout_overrides_the_queue_default() {
    let serial = SerialQueue::with_timeout_millis(0);
    let stalled = serial.enqueue_with_timeout(futures::future::pending::<()>(), 20);
    let after = serial.enqueue(async { "ran" });
    assert_eq!(stalled.await, Err(SerialError::TimedOut(20)));
    assert_eq!(after.await, Ok("ran"));
}

// ============================================================
// discard / failure
// ============================================================

#[tokio::test]
async fn test_discard_queued_settles_waiting_callers() -> anyhow::Result<()> {
    let serial = SerialQueue::new();
    let gate = park_queue(&serial).await?;

    let first = serial.enqueue(async { 1 });
    let second = serial.enqueue(async { 2 });
    assert_eq!(serial.discard_queued(), 2);
    assert_eq!(first.await, Err(SerialError::Discarded));
    assert_eq!(second.await, Err(SerialError::Discarded));

    // The running op is unaffected and the queue keeps working.
    gate.finish();
    assert_eq!(serial.enqueue(async { 3 }).await, Ok(3));
    Ok(())
}

#[tokio::test]
async fn test_panicked_op_advances_the_queue() {
    let serial = SerialQueue::new();
    let exploded = serial.enqueue(async {
        panic!("op blew up");
    });
    let after = serial.enqueue(async { 9 });
    assert_eq!(exploded.await, Err(SerialError::Discarded));
    assert_eq!(after.await, Ok(9));
}
