pub mod call_context;
pub mod client;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod eventloop;
pub mod interceptor;
pub mod message;
pub mod metadata;
pub mod server;
pub mod status;
pub mod stream;
pub mod transport;
