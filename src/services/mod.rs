pub mod auth;
pub mod canvas;
pub mod document;
pub mod draw_buffer;
pub mod room;
pub mod session;
