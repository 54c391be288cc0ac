//! Process surface of the delivery service: shared state, the health
//! endpoint and the instance-0 background loops. Dispatch routes are served
//! by a separate HTTP layer.

pub mod background;
pub mod routes;
pub mod state;
