pub mod api;
pub mod extraction;
pub mod request;
pub mod schema;
