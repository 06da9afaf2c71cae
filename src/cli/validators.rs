use std::net::SocketAddr;
use std::time::Duration;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, String> {
    let seconds: u64 = arg
        .parse()
        .map_err(|_| format!("`{arg}' isn't a valid number of seconds"))?;
    if seconds == 0 {
        return Err("the profiling duration must be at least one second".to_string());
    }
    Ok(Duration::from_secs(seconds))
}

/// Parses a listen address, accepting the port-only `:6060` shorthand.
pub(crate) fn parse_listen_addr(arg: &str) -> Result<SocketAddr, String> {
    let full = if arg.starts_with(':') {
        format!("0.0.0.0{arg}")
    } else {
        arg.to_string()
    };
    full.parse()
        .map_err(|_| format!("`{arg}' isn't a valid listen address"))
}
