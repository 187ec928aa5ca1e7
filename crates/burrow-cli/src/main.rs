//! # burrow
//!
//! Command-line front end: brings the tunnel engine up around a Linux TUN
//! device and a unix control socket, and ships small key-management helpers.

mod app;
mod commands;
mod config;
mod tun_linux;
mod uapi_listener;

fn main() {
    if let Err(e) = app::run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
