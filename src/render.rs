//! WireGuard configuration text for the server interface and for clients.
//!
//! Rendering is pure: the same settings and the same peer set always give the
//! same bytes, whatever order the peers were handed in.

use thiserror::Error;

use crate::{service::Peer, settings::ServerSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{subject}: missing required field `{field}`")]
    MissingField { field: &'static str, subject: String },
}

fn required<'a>(
    value: Option<&'a str>,
    field: &'static str,
    subject: impl FnOnce() -> String,
) -> Result<&'a str, RenderError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RenderError::MissingField {
            field,
            subject: subject(),
        }),
    }
}

fn join(values: &[String]) -> String {
    values.join(", ")
}

/// Non-revoked peers in rendering order.
pub fn active_sorted(peers: &[Peer]) -> Vec<&Peer> {
    let mut active: Vec<&Peer> = peers.iter().filter(|p| !p.revoked).collect();
    active.sort_by(|a, b| {
        (&a.owner, &a.name, &a.public_key).cmp(&(&b.owner, &b.name, &b.public_key))
    });
    active
}

pub fn render_interface(settings: &ServerSettings) -> Result<String, RenderError> {
    let address = required(settings.address.as_deref(), "address", || settings.subject())?;
    let private_key = required(settings.private_key.as_deref(), "private_key", || {
        settings.subject()
    })?;
    let port = settings
        .listen_port
        .ok_or_else(|| RenderError::MissingField {
            field: "listen_port",
            subject: settings.subject(),
        })?;

    let mut out = format!(
        "[Interface]
Address = {address}
ListenPort = {port}
PrivateKey = {private_key}
"
    );
    for cmd in &settings.post_up {
        out.push_str(&format!("PostUp = {cmd}\n"));
    }
    for cmd in &settings.post_down {
        out.push_str(&format!("PostDown = {cmd}\n"));
    }

    Ok(out)
}

/// `[Peer]` blocks of every non-revoked peer, separated by blank lines.
/// Empty when nothing is active.
pub fn render_peers(peers: &[Peer]) -> Result<String, RenderError> {
    let blocks = active_sorted(peers)
        .into_iter()
        .map(|peer| -> Result<String, RenderError> {
            let public_key = required(Some(peer.public_key.as_str()), "public_key", || {
                peer.subject()
            })?;
            Ok(format!(
                "[Peer]
PublicKey = {public_key}
AllowedIPs = {address}
",
                address = peer.address,
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(blocks.join("\n"))
}

pub fn render_server(settings: &ServerSettings, peers: &[Peer]) -> Result<String, RenderError> {
    let interface = render_interface(settings)?;
    let peers = render_peers(peers)?;

    if peers.is_empty() {
        Ok(interface)
    } else {
        Ok(format!("{interface}\n{peers}"))
    }
}

pub fn render_client(settings: &ServerSettings, peer: &Peer) -> Result<String, RenderError> {
    let private_key = required(peer.private_key.as_deref(), "private_key", || peer.subject())?;
    let server_key = required(settings.public_key.as_deref(), "public_key", || {
        settings.subject()
    })?;

    let allowed_ips = if !peer.client_allowed_ips.is_empty() {
        &peer.client_allowed_ips
    } else if !settings.client_allowed_ips.is_empty() {
        &settings.client_allowed_ips
    } else {
        return Err(RenderError::MissingField {
            field: "client_allowed_ips",
            subject: peer.subject(),
        });
    };

    let endpoint = required(settings.endpoint.as_deref(), "endpoint", || settings.subject())?;

    let dns = if peer.dns.is_empty() {
        &settings.dns
    } else {
        &peer.dns
    };

    let mut out = format!(
        "[Interface]
PrivateKey = {private_key}
Address = {address}
",
        address = peer.address,
    );
    if !dns.is_empty() {
        out.push_str(&format!("DNS = {}\n", join(dns)));
    }

    out.push_str(&format!(
        "
[Peer]
PublicKey = {server_key}
AllowedIPs = {allowed_ips}
Endpoint = {endpoint}
",
        allowed_ips = join(allowed_ips),
    ));
    if let Some(keepalive) = peer.persistent_keepalive {
        out.push_str(&format!("PersistentKeepalive = {keepalive}\n"));
    }

    Ok(out)
}
