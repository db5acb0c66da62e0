//! Callback registry for container output events

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

type DataFn = Box<dyn Fn(&str) + Send + Sync>;
type ExitFn = Box<dyn Fn(i64) + Send + Sync>;

/// Registry for stdout/stderr/exit callbacks on a container.
///
/// Panics raised by callbacks are swallowed so a misbehaving callback can
/// never break the frame read loop.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    stdout: Mutex<Vec<DataFn>>,
    stderr: Mutex<Vec<DataFn>>,
    exit: Mutex<Vec<ExitFn>>,
}

impl CallbackRegistry {
    pub fn on_stdout<F>(
        &self,
        f: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.stdout.lock().unwrap().push(Box::new(f));
    }

    pub fn on_stderr<F>(
        &self,
        f: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.stderr.lock().unwrap().push(Box::new(f));
    }

    pub fn on_exit<F>(
        &self,
        f: F,
    ) where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.exit.lock().unwrap().push(Box::new(f));
    }

    pub fn dispatch_stdout(
        &self,
        data: &str,
    ) {
        for cb in self.stdout.lock().unwrap().iter() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(data)));
        }
    }

    pub fn dispatch_stderr(
        &self,
        data: &str,
    ) {
        for cb in self.stderr.lock().unwrap().iter() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(data)));
        }
    }

    pub fn dispatch_exit(
        &self,
        exit_code: i64,
    ) {
        for cb in self.exit.lock().unwrap().iter() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(exit_code)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    #[test]
    fn dispatches_to_every_registered_callback() {
        let registry = CallbackRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in &["a", "b"] {
            let seen = seen.clone();
            let tag = tag.to_string();
            registry.on_stdout(move |data| {
                seen.lock().unwrap().push(format!("{}:{}", tag, data));
            });
        }
        registry.dispatch_stdout("hello");

        let seen = seen.lock().unwrap();
        assert_eq!(&*seen, &["a:hello".to_string(), "b:hello".to_string()]);
    }

    #[test]
    fn panicking_callback_does_not_stop_dispatch() {
        let registry = CallbackRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));

        registry.on_exit(|_| panic!("boom"));
        let counted = count.clone();
        registry.on_exit(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch_exit(0);
        registry.dispatch_exit(1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn streams_are_independent() {
        let registry = CallbackRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        registry.on_stderr(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch_stdout("ignored");
        registry.dispatch_stderr("counted");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
