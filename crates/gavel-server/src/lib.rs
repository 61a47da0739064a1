// Server side of the gavel live auction: command processor, WebSocket
// server and spectator client.

pub mod app;
pub mod observer;
pub mod ws_server;
