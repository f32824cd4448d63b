use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::event;

/// Emitted on the event bus when a guarded background task panics.
#[derive(Clone, Debug)]
pub struct BackgroundPanic {
    pub context: &'static str,
    pub message: String,
}

/// Spawns `fut` and keeps a panic inside it from unwinding past the task:
/// the panic is logged and reported as [`BackgroundPanic`] instead.
pub fn spawn_guarded<F>(context: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let message = panic_message(&panic);
            tracing::error!(%context, %message, "background task panicked");
            event::bus().emit(BackgroundPanic { context, message });
        }
    })
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn panicking_task_reports_instead_of_unwinding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = event::bus().subscribe::<BackgroundPanic, _>(move |p| {
            let _ = tx.send(p.message);
        });

        spawn_guarded("test-task", async {
            panic!("probe exploded");
        })
        .await
        .expect("guarded task itself must not panic");

        let message = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("panic report not delivered")
            .expect("channel closed");
        assert_eq!(message, "probe exploded");
        event::bus().unsubscribe(handle);
    }
}
