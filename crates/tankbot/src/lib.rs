//! tankbot - Telegram front end for the tankwatch engine.

pub mod commands;
pub mod health;
pub mod poller;
pub mod probe;
pub mod serve;
pub mod telegram;
