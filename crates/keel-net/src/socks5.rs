//! SOCKS5 client state machine (RFC 1928, RFC 1929).
//!
//! The machine does no I/O. Each step hands the caller a buffer to
//! send and the exact byte count to expect back; the caller drives the
//! socket and feeds the response into the next step. UDP association
//! is supported through the datagram wrap/strip helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ProxyError;

const SOCKS5_VERSION: u8 = 5;
const AUTH_VERSION: u8 = 1;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;

const COMMAND_CONNECT: u8 = 0x01;
const COMMAND_UDP_ASSOCIATE: u8 = 0x03;

const ADDRESS_IP4: u8 = 0x01;
const ADDRESS_DOMAIN: u8 = 0x03;
const ADDRESS_IP6: u8 = 0x04;

/// Where the tunnel should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Target {
    Endpoint(IpAddr, u16),
    Domain(String, u16),
}

/// RFC 1929 username/password credentials.
#[derive(Debug, Clone)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Send `send`, then read exactly `expect` bytes and call
    /// [`Socks5Client::next_step`] with them.
    SendAndReceive { send: Vec<u8>, expect: usize },
    /// Read `expect` more bytes without sending anything.
    Receive { expect: usize },
    /// Negotiation finished; the endpoint is available.
    Done,
    /// Negotiation failed; see [`Socks5Client::error`].
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Negotiation,
    Auth,
    Connect,
    ReceiveAddress,
    Done,
    Failed,
}

/// Five-state SOCKS5 negotiation.
pub struct Socks5Client {
    state: State,
    destination: Socks5Target,
    auth: Option<Socks5Auth>,
    udp: bool,
    address_type: u8,
    /// Fifth byte of the connect response: first address octet, or the
    /// domain length.
    first_octet: u8,
    result: Option<Socks5Target>,
    error: Option<ProxyError>,
}

impl Socks5Client {
    pub fn new(destination: Socks5Target, auth: Option<Socks5Auth>) -> Self {
        Self {
            state: State::Idle,
            destination,
            auth,
            udp: false,
            address_type: 0,
            first_octet: 0,
            result: None,
            error: None,
        }
    }

    /// Negotiate a UDP association instead of a TCP connect.
    pub fn udp_associate(destination: Socks5Target, auth: Option<Socks5Auth>) -> Self {
        let mut client = Self::new(destination, auth);
        client.udp = true;
        client
    }

    /// The negotiated endpoint, available after [`StepStatus::Done`].
    pub fn result(&self) -> Option<&Socks5Target> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ProxyError> {
        self.error.as_ref()
    }

    /// Advance the machine. `response` holds exactly the bytes the
    /// previous step asked for (empty for the first call).
    pub fn next_step(&mut self, response: &[u8]) -> StepStatus {
        match self.state {
            State::Idle => self.step_idle(),
            State::Negotiation => self.step_negotiation(response),
            State::Auth => self.step_auth(response),
            State::Connect => self.step_connect(response),
            State::ReceiveAddress => self.step_receive_address(response),
            State::Done => StepStatus::Done,
            State::Failed => StepStatus::Fail,
        }
    }

    fn fail(&mut self, error: ProxyError) -> StepStatus {
        self.state = State::Failed;
        self.error = Some(error);
        StepStatus::Fail
    }

    fn step_idle(&mut self) -> StepStatus {
        if let Socks5Target::Domain(domain, _) = &self.destination {
            if domain.is_empty() || domain.len() > u8::MAX as usize {
                return self.fail(ProxyError::InvalidParameters(format!(
                    "domain length {}",
                    domain.len()
                )));
            }
        }
        self.state = State::Negotiation;
        StepStatus::SendAndReceive {
            send: vec![
                SOCKS5_VERSION,
                2,
                METHOD_NO_AUTH,
                METHOD_USERNAME_PASSWORD,
            ],
            expect: 2,
        }
    }

    fn step_negotiation(&mut self, response: &[u8]) -> StepStatus {
        if response.len() != 2 {
            return self.fail(ProxyError::MalformedResponse);
        }
        if response[0] != SOCKS5_VERSION {
            return self.fail(ProxyError::UnsupportedVersion(response[0]));
        }
        match response[1] {
            METHOD_NO_AUTH => self.send_connect(),
            METHOD_USERNAME_PASSWORD => {
                let auth = match &self.auth {
                    Some(auth) => auth,
                    None => {
                        return self.fail(ProxyError::UnsupportedAuthMethod(
                            METHOD_USERNAME_PASSWORD,
                        ))
                    }
                };
                if auth.username.len() > u8::MAX as usize || auth.password.len() > u8::MAX as usize
                {
                    return self
                        .fail(ProxyError::InvalidParameters("credential length".into()));
                }
                let mut send =
                    Vec::with_capacity(3 + auth.username.len() + auth.password.len());
                send.push(AUTH_VERSION);
                send.push(auth.username.len() as u8);
                send.extend_from_slice(auth.username.as_bytes());
                send.push(auth.password.len() as u8);
                send.extend_from_slice(auth.password.as_bytes());
                self.state = State::Auth;
                StepStatus::SendAndReceive { send, expect: 2 }
            }
            other => self.fail(ProxyError::UnsupportedAuthMethod(other)),
        }
    }

    fn step_auth(&mut self, response: &[u8]) -> StepStatus {
        if response.len() != 2 {
            return self.fail(ProxyError::MalformedResponse);
        }
        if response[0] != AUTH_VERSION {
            return self.fail(ProxyError::UnsupportedVersion(response[0]));
        }
        if response[1] != 0 {
            return self.fail(ProxyError::AuthFailed);
        }
        self.send_connect()
    }

    fn send_connect(&mut self) -> StepStatus {
        let command = if self.udp {
            COMMAND_UDP_ASSOCIATE
        } else {
            COMMAND_CONNECT
        };
        let mut send = vec![SOCKS5_VERSION, command, 0];
        append_target(&mut send, &self.destination);

        self.state = State::Connect;
        // Version, reply, reserved, atyp, then the first octet of the
        // bound address (or the domain length).
        StepStatus::SendAndReceive { send, expect: 5 }
    }

    fn step_connect(&mut self, response: &[u8]) -> StepStatus {
        if response.len() != 5 {
            return self.fail(ProxyError::MalformedResponse);
        }
        if response[0] != SOCKS5_VERSION {
            return self.fail(ProxyError::UnsupportedVersion(response[0]));
        }
        if response[1] != 0 {
            return self.fail(ProxyError::ProxyReportedError(response[1]));
        }
        self.address_type = response[3];
        self.first_octet = response[4];

        let expect = match self.address_type {
            // 4-byte address + 2-byte port, first octet already read.
            ADDRESS_IP4 => 3 + 2,
            ADDRESS_IP6 => 15 + 2,
            ADDRESS_DOMAIN => self.first_octet as usize + 2,
            _ => return self.fail(ProxyError::MalformedResponse),
        };
        self.state = State::ReceiveAddress;
        StepStatus::Receive { expect }
    }

    fn step_receive_address(&mut self, response: &[u8]) -> StepStatus {
        let target = match self.address_type {
            ADDRESS_IP4 => {
                if response.len() != 5 {
                    return self.fail(ProxyError::MalformedResponse);
                }
                let octets = [self.first_octet, response[0], response[1], response[2]];
                let port = u16::from_be_bytes([response[3], response[4]]);
                Socks5Target::Endpoint(IpAddr::V4(Ipv4Addr::from(octets)), port)
            }
            ADDRESS_IP6 => {
                if response.len() != 17 {
                    return self.fail(ProxyError::MalformedResponse);
                }
                let mut octets = [0u8; 16];
                octets[0] = self.first_octet;
                octets[1..].copy_from_slice(&response[..15]);
                let port = u16::from_be_bytes([response[15], response[16]]);
                Socks5Target::Endpoint(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            ADDRESS_DOMAIN => {
                let len = self.first_octet as usize;
                if response.len() != len + 2 {
                    return self.fail(ProxyError::MalformedResponse);
                }
                let domain = match std::str::from_utf8(&response[..len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return self.fail(ProxyError::MalformedResponse),
                };
                let port = u16::from_be_bytes([response[len], response[len + 1]]);
                Socks5Target::Domain(domain, port)
            }
            _ => return self.fail(ProxyError::MalformedResponse),
        };
        self.result = Some(target);
        self.state = State::Done;
        StepStatus::Done
    }
}

// ── UDP datagram wrapping ─────────────────────────────────────────────────────

/// Prefix an outbound datagram with the SOCKS5 UDP request header.
pub fn wrap_udp_datagram(target: &Socks5Target, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0, 0, 0];
    append_target(&mut out, target);
    out.extend_from_slice(payload);
    out
}

/// Strip the SOCKS5 UDP header from an inbound datagram, recovering
/// the source target and the payload.
pub fn unwrap_udp_datagram(datagram: &[u8]) -> Result<(Socks5Target, &[u8]), ProxyError> {
    if datagram.len() < 4 {
        return Err(ProxyError::MalformedResponse);
    }
    let atyp = datagram[3];
    let rest = &datagram[4..];
    match atyp {
        ADDRESS_IP4 => {
            if rest.len() < 6 {
                return Err(ProxyError::MalformedResponse);
            }
            let octets: [u8; 4] = rest[..4].try_into().expect("4 bytes");
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Ok((
                Socks5Target::Endpoint(IpAddr::V4(Ipv4Addr::from(octets)), port),
                &rest[6..],
            ))
        }
        ADDRESS_IP6 => {
            if rest.len() < 18 {
                return Err(ProxyError::MalformedResponse);
            }
            let octets: [u8; 16] = rest[..16].try_into().expect("16 bytes");
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            Ok((
                Socks5Target::Endpoint(IpAddr::V6(Ipv6Addr::from(octets)), port),
                &rest[18..],
            ))
        }
        ADDRESS_DOMAIN => {
            if rest.is_empty() {
                return Err(ProxyError::MalformedResponse);
            }
            let len = rest[0] as usize;
            if rest.len() < 1 + len + 2 {
                return Err(ProxyError::MalformedResponse);
            }
            let domain = std::str::from_utf8(&rest[1..1 + len])
                .map_err(|_| ProxyError::MalformedResponse)?
                .to_string();
            let port = u16::from_be_bytes([rest[1 + len], rest[1 + len + 1]]);
            Ok((Socks5Target::Domain(domain, port), &rest[1 + len + 2..]))
        }
        _ => Err(ProxyError::MalformedResponse),
    }
}

fn append_target(out: &mut Vec<u8>, target: &Socks5Target) {
    match target {
        Socks5Target::Endpoint(IpAddr::V4(addr), port) => {
            out.push(ADDRESS_IP4);
            out.extend_from_slice(&addr.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Socks5Target::Endpoint(IpAddr::V6(addr), port) => {
            out.push(ADDRESS_IP6);
            out.extend_from_slice(&addr.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Socks5Target::Domain(domain, port) => {
            out.push(ADDRESS_DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
