//! HTTP/WebSocket surface of the TMI collaboration service.
//!
//! - [`connection`] – the websocket Connection Endpoint
//!   (`/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws`).

pub mod connection;
