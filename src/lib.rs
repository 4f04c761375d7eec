#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating most pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in timestamp/size handling
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Renderer functions are naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]
// Module structure — channels::messenger::MessengerChannel pattern by design
#![allow(clippy::module_name_repetitions)]

pub mod analytics;
pub mod bus;
pub mod channels;
pub mod config;
pub mod engine;
pub(crate) mod errors;
pub mod gateway;
pub mod store;
pub mod utils;

pub use errors::GatewayError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
