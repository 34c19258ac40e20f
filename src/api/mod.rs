//! HTTP surface
//!
//! The handlers only map between JSON and the pipeline components; all
//! policy lives in `click` and `protection`.

mod handlers;
mod protection;
mod routes;
mod track;

pub use handlers::AppState;
pub use routes::create_api_router;
