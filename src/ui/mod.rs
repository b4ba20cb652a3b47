//! UI attachment
//!
//! UIs are bus observers. Which ones exist in this build is declared in a
//! [`UiRegistry`], so asking for a missing one fails while the configuration
//! is resolved instead of after the session has started.

pub mod app;
#[cfg(feature = "tui")]
pub mod terminal;
pub mod text;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{Configuration, UiMode};
use crate::events::Observer;
use crate::transport::ShutdownTrigger;

/// What a UI gets to work with. UIs observe; the only thing they may ask of
/// the session is to stop.
#[derive(Clone)]
pub struct UiContext {
    pub config: Configuration,
    pub shutdown: ShutdownTrigger,
}

pub type UiConstructor = fn(&UiContext) -> anyhow::Result<Arc<dyn Observer>>;

#[derive(Debug, Error)]
pub enum UiError {
    #[error("ui mode '{mode}' is not available in this build")]
    Unsupported { mode: UiMode },
    #[error("failed to start {mode} ui: {reason}")]
    Construct { mode: UiMode, reason: String },
}

#[derive(Clone, Default)]
pub struct UiRegistry {
    constructors: HashMap<UiMode, UiConstructor>,
}

impl UiRegistry {
    /// No UIs at all; only `UiMode::None` resolves.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Everything compiled into this build.
    pub fn builtin() -> Self {
        let mut registry = Self::text_only();
        #[cfg(feature = "tui")]
        registry.register(UiMode::Terminal, terminal::construct);
        registry
    }

    pub fn text_only() -> Self {
        let mut registry = Self::empty();
        registry.register(UiMode::TextOnly, text::construct);
        registry
    }

    pub fn register(&mut self, mode: UiMode, constructor: UiConstructor) -> &mut Self {
        if mode != UiMode::None {
            self.constructors.insert(mode, constructor);
        }
        self
    }

    pub fn is_available(&self, mode: UiMode) -> bool {
        mode == UiMode::None || self.constructors.contains_key(&mode)
    }

    /// Build the observer for `mode`; `None` when no UI was requested.
    pub fn attach(
        &self,
        mode: UiMode,
        ctx: &UiContext,
    ) -> Result<Option<Arc<dyn Observer>>, UiError> {
        if mode == UiMode::None {
            return Ok(None);
        }
        let constructor = self
            .constructors
            .get(&mode)
            .ok_or(UiError::Unsupported { mode })?;
        let observer = constructor(ctx).map_err(|e| UiError::Construct {
            mode,
            reason: format!("{e:#}"),
        })?;
        tracing::debug!("Attached {} ui", mode);
        Ok(Some(observer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawOptions;
    use crate::events::{EventRecorder, SessionEvent};

    fn context() -> UiContext {
        UiContext {
            config: Configuration::resolve(&RawOptions::default(), &UiRegistry::empty()).unwrap(),
            shutdown: ShutdownTrigger::new(),
        }
    }

    fn recorder_ui(_: &UiContext) -> anyhow::Result<Arc<dyn Observer>> {
        Ok(EventRecorder::new())
    }

    fn broken_ui(_: &UiContext) -> anyhow::Result<Arc<dyn Observer>> {
        anyhow::bail!("no display")
    }

    #[test]
    fn none_is_always_available_and_attaches_nothing() {
        let registry = UiRegistry::empty();
        assert!(registry.is_available(UiMode::None));
        assert!(!registry.is_available(UiMode::TextOnly));
        assert!(registry.attach(UiMode::None, &context()).unwrap().is_none());
    }

    #[test]
    fn builtin_always_has_text() {
        let registry = UiRegistry::builtin();
        assert!(registry.is_available(UiMode::TextOnly));
        assert_eq!(registry.is_available(UiMode::Terminal), cfg!(feature = "tui"));
    }

    #[test]
    fn attach_uses_registered_constructor() {
        let mut registry = UiRegistry::empty();
        registry.register(UiMode::TextOnly, recorder_ui);

        let observer = registry
            .attach(UiMode::TextOnly, &context())
            .unwrap()
            .expect("observer");
        assert_eq!(observer.name(), "recorder");
        observer.on_event(&SessionEvent::SessionStopped).unwrap();
    }

    #[test]
    fn missing_and_failing_constructors_are_errors() {
        let mut registry = UiRegistry::empty();
        assert!(matches!(
            registry.attach(UiMode::Terminal, &context()),
            Err(UiError::Unsupported { mode: UiMode::Terminal })
        ));

        registry.register(UiMode::Terminal, broken_ui);
        match registry.attach(UiMode::Terminal, &context()) {
            Err(UiError::Construct { reason, .. }) => assert_eq!(reason, "no display"),
            other => panic!("unexpected {:?}", other.map(|o| o.map(|_| ()))),
        }
    }
}
