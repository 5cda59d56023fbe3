//! Process-wide state: the topology, the attached programs and the display
//! selection, created once at startup and torn down explicitly.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use crate::config::{Settings, TopologyDescription};
use crate::dataplane::{Attachments, EngineLoader};
use crate::error::Result;
use crate::link::LinkControl;
use crate::loader::load_topology;
use crate::selector::Selector;
use crate::topology::Topology;
use crate::types::DisplayMode;

/// State shared by the sampling scheduler and the selection handler.
pub type SharedState = Arc<Mutex<AppState>>;

/// Input event of the selection collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Left,
    Right,
    Up,
    Down,
    Mode(DisplayMode),
}

#[derive(Debug)]
pub struct AppState {
    pub topology: Topology,
    pub attachments: Attachments,
    /// `None` only while the topology has no input.
    pub selector: Option<Selector>,
    pub settings: Settings,
}

impl AppState {
    /// Empty state. Nothing is attached until [`AppState::bootstrap`].
    pub fn new(settings: Settings) -> Self {
        AppState {
            topology: Topology::new(settings.history_depth),
            attachments: Attachments::new(),
            selector: None,
            settings,
        }
    }

    /// Loads `desc` and selects the first input. On failure every program
    /// attached so far is detached before the error is returned.
    #[instrument(skip_all)]
    pub async fn bootstrap(
        desc: &TopologyDescription,
        settings: Settings,
        link: &dyn LinkControl,
        engines: &mut dyn EngineLoader,
    ) -> Result<Self> {
        settings.validate()?;
        let mut state = AppState::new(settings);
        let loaded = load_topology(
            desc,
            link,
            engines,
            &mut state.topology,
            &mut state.attachments,
        )
        .await;

        match loaded {
            Ok(()) => {
                state.selector = Selector::new(&state.topology);
                Ok(state)
            }
            Err(e) => {
                error!(error = %e, "Topology load failed, cleaning up");
                state.cleanup();
                Err(e)
            }
        }
    }

    /// Detaches every program. Returns how many detached cleanly.
    pub fn cleanup(&mut self) -> usize {
        let total = self.attachments.len();
        let detached = self.attachments.detach_all();
        info!(detached, total, "Cleaned up attachments");
        detached
    }

    /// Applies one selection event. Returns true if the display must redraw.
    pub fn navigate(&mut self, event: Navigation) -> bool {
        let Some(selector) = self.selector.as_mut() else {
            return false;
        };
        let topology = &self.topology;
        match event {
            Navigation::Left => selector.left(topology),
            Navigation::Right => selector.right(topology),
            Navigation::Up => selector.up(topology),
            Navigation::Down => selector.down(topology),
            Navigation::Mode(mode) => selector.set_mode(mode),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyFile;
    use crate::error::VlanRedirError;
    use crate::testing::{FakeEngineLoader, FakeKernel, FakeLink};
    use crate::topology::EntityRef;
    use pretty_assertions::assert_eq;

    fn describe(json: &str) -> TopologyDescription {
        TopologyFile::from_json(json).unwrap().validate().unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_and_cleanup() {
        let link = FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]);
        let kernel = FakeKernel::default();
        let mut engines = FakeEngineLoader::new(kernel.clone());
        let desc = describe(r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "eth2" } } } }"#);

        let mut state = AppState::bootstrap(&desc, Settings::default(), &link, &mut engines)
            .await
            .unwrap();
        assert_eq!(
            state.selector.unwrap().selected,
            EntityRef::Input { ifindex: 2 }
        );
        assert_eq!(state.topology.history_depth(), Settings::default().history_depth);
        assert_eq!(kernel.attached(), vec![2]);

        assert_eq!(state.cleanup(), 1);
        assert!(kernel.attached().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_detaches_everything() {
        let link = FakeLink::with_interfaces(&[("eth0", 2), ("eth1", 3)]);
        let kernel = FakeKernel::default();
        let mut engines = FakeEngineLoader::new(kernel.clone());
        let desc = describe(r#"{ "interfaces": { "eth0": {}, "eth1": {} } }"#);

        let err = AppState::bootstrap(&desc, Settings::default(), &link, &mut engines)
            .await
            .unwrap_err();
        assert!(matches!(err, VlanRedirError::TopologyIncomplete { inputs: 2, outputs: 0 }));
        assert!(kernel.attached().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_load() {
        let link = FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]);
        let mut engines = FakeEngineLoader::new(FakeKernel::default());
        let desc = describe(r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "eth2" } } } }"#);
        let settings = Settings {
            history_depth: 0,
            ..Default::default()
        };

        let err = AppState::bootstrap(&desc, settings, &link, &mut engines)
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(link.calls().is_empty());
    }

    #[test]
    fn test_navigate() {
        let mut state = AppState::new(Settings::default());
        assert!(!state.navigate(Navigation::Right));

        state.topology.insert_input(2, "eth0");
        state.topology.insert_output(7, "eth2");
        state.selector = Selector::new(&state.topology);
        assert!(state.navigate(Navigation::Right));
        assert_eq!(
            state.selector.unwrap().selected,
            EntityRef::Output { ifindex: 7 }
        );
        assert!(state.navigate(Navigation::Mode(DisplayMode::Dropped)));
        assert_eq!(state.selector.unwrap().mode, DisplayMode::Dropped);
    }
}
