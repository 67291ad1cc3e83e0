#![forbid(unsafe_code)]

pub mod app_services;
pub mod config;
pub mod content;
pub mod controller;
pub mod error;
pub mod identity;
pub mod navigation;
pub mod progress;
pub mod saver;
pub mod tracker;

pub use ide_core::Clock;

pub use app_services::AppServices;
pub use config::{SyncConfig, TrackerConfig};
pub use controller::{SessionController, SessionHandle};
pub use error::{AppServicesError, ConfigError, MountError, SessionError, SyncError};
pub use identity::IdentityResolver;
pub use navigation::LessonNavigationCoordinator;
pub use progress::ProgressRecordResolver;
pub use saver::{
    CodeSnapshotSaver, LocalOnlyReason, Notice, NoticeLevel, SaveOutcome, SessionObserver,
};
pub use tracker::{TimeTracker, TrackerStatus};
