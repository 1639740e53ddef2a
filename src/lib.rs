// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - config:        Configuration structs loaded from JSON
// - schema:        Data kinds, sports, collected records
// - util:          Origin keys, record counts, JSON accessors
// - error:         Typed errors of every component
// - rate_limiter:  Fixed-window limiter keyed by origin
// - registry:      Source registry with revisioned entries
// - fetchers:      Fetch adapters and the adapter registry
// - bus:           Typed event bus with bounded subscribers
// - collector:     One polling loop per source
// - router:        Normalization, storage and predictions
// - monitor:       Source metrics, error buffer, health
// - collaborators: Storage / prediction / sink contracts
// - notifier:      WebSocket pool to the notification hub
// - pipeline:      Owner of everything, explicit lifecycle
//
pub mod bus;
pub mod collaborators;
pub mod collector;
pub mod config;
pub mod error;
pub mod fetchers;
pub mod metrics;
pub mod monitor;
pub mod notifier;
pub mod pipeline;
pub mod rate_limiter;
pub mod registry;
pub mod router;
pub mod schema;
pub mod util;

pub use bus::{PipelineEvent, ProcessedUpdate};
pub use config::{Config, SourceConfig};
pub use pipeline::{Collaborators, Pipeline, PipelineStatus};
pub use schema::{CollectedRecord, CollectionError, DataKind, FetchMechanism, Sport};
