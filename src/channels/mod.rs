pub mod base;
pub mod broadcast;
pub mod dispatcher;
pub mod messenger;
pub mod relay;
pub mod typing;
pub mod web;
