use anyhow::{anyhow, Error};
use log::debug;

type CleanupFn = Box<dyn FnOnce() -> Result<(), Error>>;

struct Closer {
    name: String,
    callback: CleanupFn,
}

/// An ordered stack of cleanup callbacks, released in reverse order of
/// registration. Every mount, loop attachment, and scratch directory pushes
/// its inverse here the moment it is created, so all exit paths release
/// resources the same way.
#[derive(Default)]
pub struct CleanupStack {
    closers: Vec<Closer>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a closer on top of the stack.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        callback: impl FnOnce() -> Result<(), Error> + 'static,
    ) {
        self.closers.push(Closer {
            name: name.into(),
            callback: Box::new(callback),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }

    /// Pops and invokes every closer, top down. All closers run even when
    /// earlier ones fail; failures are collected into one combined error. If
    /// `prior` is given it stays the leading message, with any cleanup
    /// failures appended after a linebreak.
    pub fn cleanup(&mut self, prior: Option<Error>) -> Result<(), Error> {
        let mut failures: Vec<String> = Vec::new();

        while let Some(closer) = self.closers.pop() {
            debug!("Running cleanup '{}'", closer.name);
            if let Err(e) = (closer.callback)() {
                failures.push(format!("{}: {e:#}", closer.name));
            }
        }

        match (prior, failures.is_empty()) {
            (None, true) => Ok(()),
            (None, false) => Err(anyhow!(failures.join("\n"))),
            (Some(prior), true) => Err(prior),
            (Some(prior), false) => Err(anyhow!("{prior:#}\n{}", failures.join("\n"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, CleanupStack) {
        (Arc::new(Mutex::new(Vec::new())), CleanupStack::new())
    }

    #[test]
    fn test_cleanup_runs_in_reverse_order() {
        let (order, mut stack) = recorder();
        for name in ["A", "B", "C"] {
            let order = order.clone();
            stack.push(name, move || {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        stack.cleanup(None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_failures_are_collected_across_closers() {
        let (order, mut stack) = recorder();
        {
            let order = order.clone();
            stack.push("A", move || {
                order.lock().unwrap().push("A");
                Ok(())
            });
        }
        stack.push("B", || Err(anyhow!("B broke")));
        stack.push("C", || Err(anyhow!("C broke")));

        let error = stack.cleanup(None).unwrap_err();
        let message = format!("{error:#}");
        // C runs first and its failure survives B's
        assert!(message.contains("C: C broke"));
        assert!(message.contains("B: B broke"));
        // A still ran despite the failures above it
        assert_eq!(*order.lock().unwrap(), vec!["A"]);
    }

    #[test]
    fn test_prior_error_stays_primary() {
        let mut stack = CleanupStack::new();
        stack.push("umount", || Err(anyhow!("busy")));

        let error = stack.cleanup(Some(anyhow!("deploy failed"))).unwrap_err();
        let message = format!("{error:#}");
        let prior_at = message.find("deploy failed").unwrap();
        let cleanup_at = message.find("umount: busy").unwrap();
        assert!(prior_at < cleanup_at);
        assert!(message.contains('\n'));
    }

    #[test]
    fn test_prior_error_without_failures() {
        let mut stack = CleanupStack::new();
        stack.push("noop", || Ok(()));
        let error = stack.cleanup(Some(anyhow!("original"))).unwrap_err();
        assert_eq!(format!("{error:#}"), "original");
    }

    #[test]
    fn test_empty_stack_is_ok() {
        let mut stack = CleanupStack::new();
        stack.cleanup(None).unwrap();
    }
}
