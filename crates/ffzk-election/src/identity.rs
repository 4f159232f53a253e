//! Participant identity

const FALLBACK_ADDRESS: &str = "127.0.0.1";

/// Build the id this process registers under: `{name}@{pid}`.
///
/// `name` is the configured application name, or the local IP address when
/// none is set.
pub fn participant_id(application_name: Option<&str>) -> String {
    let name = match application_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => local_address(),
    };
    format!("{}@{}", name, std::process::id())
}

fn local_address() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::warn!(
                "Failed to detect local address, using {}: {}",
                FALLBACK_ADDRESS,
                e
            );
            FALLBACK_ADDRESS.to_string()
        }
    }
}
