/// Credential verification seam.
pub mod auth;
/// OpenAPI documentation generation.
pub mod documentation;
/// Pure telemetry folding into match state.
pub mod event_parser;
/// Health check service.
pub mod health_service;
/// Periodic presence signal to every socket.
pub mod heartbeat;
/// Relay hub operations shared by every transport.
pub mod hub_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
