use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Shared cancellation state.
///
/// The first interrupt requests a graceful stop: no new graph nodes are
/// dispatched and running providers are asked to stop. The second interrupt
/// is a hard abort; state loss is possible and the process exits as soon as
/// the state manager has flushed.
#[derive(Clone, Debug)]
pub struct InterruptState {
    level: Arc<AtomicU8>,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}
impl Error for InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            level: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn signal(&self) {
        self.level.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.level.load(Ordering::SeqCst) >= 1
    }

    pub fn is_aborted(&self) -> bool {
        self.level.load(Ordering::SeqCst) >= 2
    }

    pub fn check_interrupted_raw(&self) -> Result<(), InterruptedError> {
        if self.is_interrupted() {
            Err(InterruptedError {})
        } else {
            Ok(())
        }
    }

    pub fn check_interrupted(&self) -> anyhow::Result<()> {
        self.check_interrupted_raw().map_err(|x| x.into())
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted.signal();
        if interrupted.is_aborted() {
            eprintln!("aborting immediately; state may be incomplete");
        }
    })
    .expect("Error setting interrupt handler");
}

pub fn set_up_process_interrupt_handler() -> InterruptState {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state);
    interrupt_state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_phase_levels() {
        let s = InterruptState::new();
        assert!(!s.is_interrupted());
        assert!(s.check_interrupted().is_ok());
        s.signal();
        assert!(s.is_interrupted());
        assert!(!s.is_aborted());
        assert!(s.check_interrupted().is_err());
        s.signal();
        assert!(s.is_aborted());
    }
}
