//! Mock Rule Server
//!
//! An HTTP mock server that answers requests from rules grouped into
//! projects. Rules live in YAML files on disk, listed by a project index,
//! and can be created, edited and removed at runtime through the [`Store`].
//!
//! # Features
//!
//! - **Project Routing**: `/<project>/<path>` selects the project, or a
//!   single active project is served at the root
//! - **Path Templates**: `:param` segments and a trailing `*` wildcard
//! - **Dynamic Templates**: Handlebars-rendered status, headers, cookies,
//!   body and latency, with pluggable templating engines
//! - **Conditional Responses**: the first response whose condition renders
//!   to `true` wins
//! - **Latency Simulation**: fixed or random delays measured from arrival
//! - **Compression**: gzip and deflate bodies via `content-encoding`
//! - **Serialized Persistence**: all rule file writes go through one queue
//!
//! # Example Index
//!
//! ```yaml
//! - name: shop
//!   rules:
//!     - shop/*.yaml
//! ```
//!
//! # Example Rule
//!
//! ```yaml
//! name: get-user
//! request:
//!   method: GET
//!   path: /users/:id
//! response:
//!   contentType: application/json
//!   fixedLatency:
//!     value: 150
//!   body: '{"id": "{{params.id}}"}'
//! ```

pub mod config;
pub mod engine;
pub mod latency;
pub mod matcher;
pub mod model;
pub mod queue;
pub mod server;
pub mod store;
pub mod template;
pub mod validate;

pub use config::{DispatchSettings, ServerSettings};
pub use engine::{DispatchError, MockEngine, MockRequest, MockResponse};
pub use model::{Project, ProjectRule, Rule, RuleDraft};
pub use server::{router, serve, AppState};
pub use store::{Store, StoreError};
pub use template::{TemplateRegistry, TemplatingEngine};
pub use validate::{SchemaValidator, Validator};
