pub mod catalog;
pub mod search;

#[cfg(test)]
mod test_server;

pub use catalog::HttpCatalog;
pub use search::{ApiConfig, ReqwestSearchApi};
