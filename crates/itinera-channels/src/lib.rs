pub mod web;
mod web_assets;

pub use web::WebChannel;
