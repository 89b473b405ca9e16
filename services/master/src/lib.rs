// master: HomeBrew DMR master server.
//
// Accepts UDP connections from DMR repeaters, authenticates them, tracks
// per-timeslot transmissions, and forwards voice/data between repeaters and
// outbound links according to per-repeater talkgroup policy.

pub mod access;
pub mod config;
pub mod events;
pub mod master;
pub mod outbound;
pub mod peer;
pub mod routing;
pub mod stream;
pub mod user_cache;

pub use config::{load_config, load_config_from_path, load_config_from_str, Config};
pub use events::{DashboardEvent, EventEmitter};
pub use master::Master;
