pub mod cleanup;
pub mod config;
pub mod engagement;
pub mod error;
pub mod executor;
pub mod ffmpeg;
pub mod handlers;
pub mod harvester;
pub mod media;
pub mod models;
pub mod pipeline;
pub mod seed;
pub mod store;
pub mod stream;
pub mod youtube;
