pub mod browser;
pub mod pages;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod simulator;

pub use pipeline::{MockIdpPipeline, PipelineBuilder};
pub use server::{AppState, build_router, serve};
