pub mod api;
pub mod fetch;
pub mod http;
pub mod pool;
pub mod shaper;
pub mod stream;
