use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle of one model instance.
///
/// ```text
/// Idle -> Loading -> Loaded <-> Generating
///                      |
///                  Unloading -> Idle
/// any -> Error -> Idle (after forced cleanup)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelState {
    Idle,
    Loading,
    Loaded,
    /// Transient: busy with one unit of work, still the resident model.
    Generating,
    Unloading,
    Error,
}

impl ModelState {
    pub fn can_transition_to(self, next: ModelState) -> bool {
        use ModelState::*;
        match (self, next) {
            (Error, Idle) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Idle, Loading)
            | (Loading, Loaded)
            | (Loaded, Generating)
            | (Generating, Loaded)
            | (Loaded, Unloading)
            | (Unloading, Idle) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: ModelState) -> Result<()> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(Error::InvalidTransition(format!("{self:?} -> {next:?}")))
        }
    }

    /// Loaded or busy generating: the instance can accept work.
    pub fn is_serving(self) -> bool {
        matches!(self, ModelState::Loaded | ModelState::Generating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cycle() {
        let mut state = ModelState::Idle;
        for next in [
            ModelState::Loading,
            ModelState::Loaded,
            ModelState::Generating,
            ModelState::Loaded,
            ModelState::Unloading,
            ModelState::Idle,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, ModelState::Idle);
    }

    #[test]
    fn error_only_returns_to_idle() {
        let mut state = ModelState::Loading;
        state.transition(ModelState::Error).unwrap();
        assert!(state.transition(ModelState::Loading).is_err());
        assert!(state.transition(ModelState::Loaded).is_err());
        state.transition(ModelState::Idle).unwrap();
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!ModelState::Idle.can_transition_to(ModelState::Loaded));
        assert!(!ModelState::Idle.can_transition_to(ModelState::Generating));
        assert!(!ModelState::Generating.can_transition_to(ModelState::Unloading));
        assert!(!ModelState::Loading.can_transition_to(ModelState::Generating));
    }
}
