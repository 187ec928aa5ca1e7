//! # Control Socket Listener
//!
//! Accepts connections on a unix-domain socket and hands each one to the
//! engine's control protocol. One operation per connection.

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use burrow_core::{uapi, Device};
use log::{debug, warn};

/// Bind the control socket and serve it on a background thread
pub fn spawn(device: Arc<Device>, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // a previous instance may have left its socket behind
    let _ = fs::remove_file(path);

    let listener = UnixListener::bind(path)?;
    debug!("control socket at {}", path.display());

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(mut stream) => {
                    let device = Arc::clone(&device);
                    thread::spawn(move || uapi::handle(&device, &mut stream));
                }
                Err(e) => {
                    warn!("control socket accept failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok(())
}
