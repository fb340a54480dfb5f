//! Binary messages exchanged with the verification server.
//!
//! Every message is framed as `[type:1][length:2][payload]`, big-endian,
//! where `length` counts the whole frame including the three header bytes.
//! A server reply is a plain concatenation of frames and must tile the
//! buffer exactly; a decode that ends mid-frame is a protocol-integrity
//! violation, not a partial result.

use std::net::IpAddr;

use certhunt_core::{CertHash, IpVersion};
use thiserror::Error;

pub const MSG_PUBLIC_IP_NOTIF4: u8 = 0;
pub const MSG_PUBLIC_IP_NOTIF6: u8 = 1;
pub const MSG_PUBLIC_IP_NOTIF_REQUEST: u8 = 2;
pub const MSG_CURRENT_SERVER_TIME: u8 = 5;
pub const MSG_SIGNATURE: u8 = 6;
pub const MSG_TASK4: u8 = 10;
pub const MSG_TASK6: u8 = 11;
pub const MSG_TASK_REPLY_NEW_CERT: u8 = 20;
pub const MSG_TASK_REPLY_KNOWN_CERT: u8 = 21;
pub const MSG_CERT_VERIFY_REQUEST: u8 = 100;
pub const MSG_CERT_VERIFY_RESULT: u8 = 110;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("message does not fit in a frame")]
    Oversize,
}

/// A task received from the server: probe `target_ip:target_port` and report
/// back. `known_hashes` lets the client answer with just a digest when the
/// server has already seen the certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuntingTask {
    pub task_id: u32,
    pub ip_version: IpVersion,
    pub known_hashes: Vec<CertHash>,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The public IP the server observed for this client, with the server's
    /// HMAC over it. The HMAC is carried opaquely and echoed in replies.
    PublicIpNotif { ip: IpAddr, hmac: [u8; 32] },
    /// Asks the server for a PublicIpNotif; carries the RSA-OAEP-encrypted
    /// session key that protects the reply.
    PublicIpNotifRequest { sealed_key: Vec<u8> },
    CurrentServerTime { unix: u32 },
    /// Signature over the surrounding message list (with this frame
    /// removed). Opaque to the codec.
    Signature { data: Vec<u8> },
    HuntingTask(HuntingTask),
    TaskReplyNewCert {
        task_id: u32,
        server_time: u32,
        hmac: [u8; 32],
        chain: Vec<Vec<u8>>,
        trace: String,
    },
    TaskReplyKnownCert {
        task_id: u32,
        server_time: u32,
        hmac: [u8; 32],
        cert_hash: CertHash,
        trace: String,
    },
    CertVerifyRequest {
        options: u8,
        chain: Vec<Vec<u8>>,
        host: String,
    },
    CertVerifyResult { rating: u8, report: String },
}

/// Decode a whole buffer into its message sequence. Fails as a unit: one
/// bad frame poisons the entire reply.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Message>, CodecError> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        if buf.len() - off < 3 {
            return Err(CodecError::Malformed("truncated frame header"));
        }
        let ty = buf[off];
        let len = u16::from_be_bytes([buf[off + 1], buf[off + 2]]) as usize;
        if len < 3 {
            return Err(CodecError::Malformed("frame length below header size"));
        }
        if off + len > buf.len() {
            return Err(CodecError::Malformed("frame length exceeds buffer"));
        }
        out.push(decode_payload(ty, &buf[off + 3..off + len])?);
        off += len;
    }
    Ok(out)
}

/// Encode one message into its frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let (ty, payload) = match msg {
        Message::PublicIpNotif { ip, hmac } => {
            let ty = match ip {
                IpAddr::V4(_) => MSG_PUBLIC_IP_NOTIF4,
                IpAddr::V6(_) => MSG_PUBLIC_IP_NOTIF6,
            };
            let mut p = Vec::with_capacity(32 + IpVersion::of(ip).addr_len());
            p.extend_from_slice(hmac);
            push_ip(&mut p, ip);
            (ty, p)
        }
        Message::PublicIpNotifRequest { sealed_key } => {
            (MSG_PUBLIC_IP_NOTIF_REQUEST, sealed_key.clone())
        }
        Message::CurrentServerTime { unix } => (MSG_CURRENT_SERVER_TIME, unix.to_be_bytes().to_vec()),
        Message::Signature { data } => (MSG_SIGNATURE, data.clone()),
        Message::HuntingTask(task) => {
            let ty = match task.ip_version {
                IpVersion::V4 => MSG_TASK4,
                IpVersion::V6 => MSG_TASK6,
            };
            if task.known_hashes.len() > u8::MAX as usize {
                return Err(CodecError::Oversize);
            }
            if IpVersion::of(&task.target_ip) != task.ip_version {
                return Err(CodecError::Malformed("target address family mismatch"));
            }
            let mut p = Vec::new();
            p.extend_from_slice(&task.task_id.to_be_bytes());
            p.push(task.known_hashes.len() as u8);
            for h in &task.known_hashes {
                p.extend_from_slice(h.as_bytes());
            }
            push_ip(&mut p, &task.target_ip);
            p.extend_from_slice(&task.target_port.to_be_bytes());
            p.extend_from_slice(task.hostname.as_bytes());
            (ty, p)
        }
        Message::TaskReplyNewCert {
            task_id,
            server_time,
            hmac,
            chain,
            trace,
        } => {
            if chain.len() > u8::MAX as usize {
                return Err(CodecError::Oversize);
            }
            let mut p = Vec::new();
            p.extend_from_slice(&task_id.to_be_bytes());
            p.extend_from_slice(&server_time.to_be_bytes());
            p.extend_from_slice(hmac);
            p.push(chain.len() as u8);
            for cert in chain {
                p.extend_from_slice(cert);
            }
            p.extend_from_slice(trace.as_bytes());
            (MSG_TASK_REPLY_NEW_CERT, p)
        }
        Message::TaskReplyKnownCert {
            task_id,
            server_time,
            hmac,
            cert_hash,
            trace,
        } => {
            let mut p = Vec::new();
            p.extend_from_slice(&task_id.to_be_bytes());
            p.extend_from_slice(&server_time.to_be_bytes());
            p.extend_from_slice(hmac);
            p.extend_from_slice(cert_hash.as_bytes());
            p.extend_from_slice(trace.as_bytes());
            (MSG_TASK_REPLY_KNOWN_CERT, p)
        }
        Message::CertVerifyRequest {
            options,
            chain,
            host,
        } => {
            if chain.len() > u8::MAX as usize {
                return Err(CodecError::Oversize);
            }
            let mut p = Vec::new();
            p.push(*options);
            p.push(chain.len() as u8);
            for cert in chain {
                p.extend_from_slice(cert);
            }
            p.extend_from_slice(host.as_bytes());
            (MSG_CERT_VERIFY_REQUEST, p)
        }
        Message::CertVerifyResult { rating, report } => {
            let mut p = Vec::with_capacity(1 + report.len());
            p.push(*rating);
            p.extend_from_slice(report.as_bytes());
            (MSG_CERT_VERIFY_RESULT, p)
        }
    };
    frame(ty, payload)
}

fn frame(ty: u8, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    let total = payload.len() + 3;
    if total > u16::MAX as usize {
        return Err(CodecError::Oversize);
    }
    let mut out = Vec::with_capacity(total);
    out.push(ty);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_payload(ty: u8, p: &[u8]) -> Result<Message, CodecError> {
    match ty {
        MSG_PUBLIC_IP_NOTIF4 => decode_public_ip(p, IpVersion::V4),
        MSG_PUBLIC_IP_NOTIF6 => decode_public_ip(p, IpVersion::V6),
        MSG_PUBLIC_IP_NOTIF_REQUEST => Ok(Message::PublicIpNotifRequest {
            sealed_key: p.to_vec(),
        }),
        MSG_CURRENT_SERVER_TIME => {
            let bytes: [u8; 4] = p
                .try_into()
                .map_err(|_| CodecError::Malformed("bad server-time length"))?;
            Ok(Message::CurrentServerTime {
                unix: u32::from_be_bytes(bytes),
            })
        }
        MSG_SIGNATURE => Ok(Message::Signature { data: p.to_vec() }),
        MSG_TASK4 => decode_task(p, IpVersion::V4),
        MSG_TASK6 => decode_task(p, IpVersion::V6),
        MSG_TASK_REPLY_NEW_CERT => decode_reply_new_cert(p),
        MSG_TASK_REPLY_KNOWN_CERT => decode_reply_known_cert(p),
        MSG_CERT_VERIFY_REQUEST => decode_verify_request(p),
        MSG_CERT_VERIFY_RESULT => {
            if p.is_empty() {
                return Err(CodecError::Malformed("empty verify result"));
            }
            Ok(Message::CertVerifyResult {
                rating: p[0],
                report: utf8(&p[1..], "verify report")?,
            })
        }
        other => Err(CodecError::UnknownType(other)),
    }
}

fn decode_public_ip(p: &[u8], version: IpVersion) -> Result<Message, CodecError> {
    if p.len() != 32 + version.addr_len() {
        return Err(CodecError::Malformed("bad public-ip notification length"));
    }
    let mut hmac = [0u8; 32];
    hmac.copy_from_slice(&p[..32]);
    Ok(Message::PublicIpNotif {
        ip: read_ip(&p[32..], version)?,
        hmac,
    })
}

fn decode_task(p: &[u8], version: IpVersion) -> Result<Message, CodecError> {
    if p.len() < 5 {
        return Err(CodecError::Malformed("truncated hunting task"));
    }
    let task_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
    let count = p[4] as usize;
    let fixed = 5 + count * 32 + version.addr_len() + 2;
    if p.len() < fixed {
        return Err(CodecError::Malformed("truncated hunting task"));
    }
    let mut known_hashes = Vec::with_capacity(count);
    for i in 0..count {
        let mut h = [0u8; 32];
        h.copy_from_slice(&p[5 + i * 32..5 + (i + 1) * 32]);
        known_hashes.push(CertHash(h));
    }
    let ip_off = 5 + count * 32;
    let target_ip = read_ip(&p[ip_off..ip_off + version.addr_len()], version)?;
    let port_off = ip_off + version.addr_len();
    let target_port = u16::from_be_bytes([p[port_off], p[port_off + 1]]);
    Ok(Message::HuntingTask(HuntingTask {
        task_id,
        ip_version: version,
        known_hashes,
        target_ip,
        target_port,
        hostname: utf8(&p[fixed..], "task hostname")?,
    }))
}

fn decode_reply_new_cert(p: &[u8]) -> Result<Message, CodecError> {
    if p.len() < 41 {
        return Err(CodecError::Malformed("truncated task reply"));
    }
    let task_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
    let server_time = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
    let mut hmac = [0u8; 32];
    hmac.copy_from_slice(&p[8..40]);
    let (chain, rest) = split_chain(&p[41..], p[40] as usize)?;
    Ok(Message::TaskReplyNewCert {
        task_id,
        server_time,
        hmac,
        chain,
        trace: utf8(rest, "reply trace")?,
    })
}

fn decode_reply_known_cert(p: &[u8]) -> Result<Message, CodecError> {
    if p.len() < 72 {
        return Err(CodecError::Malformed("truncated task reply"));
    }
    let task_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
    let server_time = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
    let mut hmac = [0u8; 32];
    hmac.copy_from_slice(&p[8..40]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&p[40..72]);
    Ok(Message::TaskReplyKnownCert {
        task_id,
        server_time,
        hmac,
        cert_hash: CertHash(hash),
        trace: utf8(&p[72..], "reply trace")?,
    })
}

fn decode_verify_request(p: &[u8]) -> Result<Message, CodecError> {
    if p.len() < 2 {
        return Err(CodecError::Malformed("truncated verify request"));
    }
    let (chain, rest) = split_chain(&p[2..], p[1] as usize)?;
    Ok(Message::CertVerifyRequest {
        options: p[0],
        chain,
        host: utf8(rest, "verify host")?,
    })
}

/// Split `count` DER certificates off the front of `rest`. The certificates
/// carry no explicit length on the wire; each one is delimited by its own
/// outer TLV header.
fn split_chain(mut rest: &[u8], count: usize) -> Result<(Vec<Vec<u8>>, &[u8]), CodecError> {
    let mut chain = Vec::with_capacity(count);
    for _ in 0..count {
        let len = der_len(rest)?;
        if len > rest.len() {
            return Err(CodecError::Malformed("certificate overruns frame"));
        }
        chain.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    Ok((chain, rest))
}

/// Total length of the DER value starting at `b`, header included. Only the
/// outer TLV header is inspected; the content stays opaque.
fn der_len(b: &[u8]) -> Result<usize, CodecError> {
    if b.len() < 2 {
        return Err(CodecError::Malformed("truncated certificate header"));
    }
    let first = b[1];
    if first & 0x80 == 0 {
        return Ok(2 + first as usize);
    }
    let octets = (first & 0x7f) as usize;
    if octets == 0 || octets > 4 || b.len() < 2 + octets {
        return Err(CodecError::Malformed("invalid certificate length"));
    }
    let mut len = 0usize;
    for i in 0..octets {
        len = (len << 8) | b[2 + i] as usize;
    }
    Ok(2 + octets + len)
}

fn push_ip(out: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
}

fn read_ip(b: &[u8], version: IpVersion) -> Result<IpAddr, CodecError> {
    match version {
        IpVersion::V4 => {
            let octets: [u8; 4] = b
                .try_into()
                .map_err(|_| CodecError::Malformed("bad address length"))?;
            Ok(IpAddr::from(octets))
        }
        IpVersion::V6 => {
            let octets: [u8; 16] = b
                .try_into()
                .map_err(|_| CodecError::Malformed("bad address length"))?;
            Ok(IpAddr::from(octets))
        }
    }
}

fn utf8(b: &[u8], what: &'static str) -> Result<String, CodecError> {
    String::from_utf8(b.to_vec()).map_err(|_| CodecError::Malformed(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use certhunt_core::sha256;
    use std::net::{Ipv4Addr, Ipv6Addr};

    // Short-form DER blob for test chains; real certificates differ only in
    // the header, which is all the codec looks at.
    fn der_blob(body: &[u8]) -> Vec<u8> {
        assert!(body.len() < 128);
        let mut v = vec![0x30, body.len() as u8];
        v.extend_from_slice(body);
        v
    }

    fn der_blob_long(len: usize) -> Vec<u8> {
        assert!((128..65536).contains(&len));
        let mut v = vec![0x30, 0x82, (len >> 8) as u8, (len & 0xff) as u8];
        v.extend(std::iter::repeat(0xab).take(len));
        v
    }

    fn roundtrip(msg: Message) {
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode_all(&bytes).unwrap(), vec![msg]);
    }

    #[test]
    fn roundtrip_public_ip_both_families() {
        roundtrip(Message::PublicIpNotif {
            ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            hmac: [7u8; 32],
        });
        roundtrip(Message::PublicIpNotif {
            ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            hmac: [9u8; 32],
        });
    }

    #[test]
    fn roundtrip_public_ip_request_and_signature() {
        roundtrip(Message::PublicIpNotifRequest {
            sealed_key: vec![1, 2, 3, 4, 5],
        });
        roundtrip(Message::Signature {
            data: vec![0u8; 256],
        });
    }

    #[test]
    fn roundtrip_server_time() {
        roundtrip(Message::CurrentServerTime { unix: 1_700_000_000 });
    }

    #[test]
    fn roundtrip_hunting_task() {
        roundtrip(Message::HuntingTask(HuntingTask {
            task_id: 4242,
            ip_version: IpVersion::V4,
            known_hashes: vec![sha256(b"a"), sha256(b"b")],
            target_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            target_port: 443,
            hostname: "www.example.com".into(),
        }));
        roundtrip(Message::HuntingTask(HuntingTask {
            task_id: 1,
            ip_version: IpVersion::V6,
            known_hashes: vec![],
            target_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            target_port: 8443,
            hostname: "x".repeat(2000),
        }));
    }

    #[test]
    fn roundtrip_task_replies() {
        roundtrip(Message::TaskReplyNewCert {
            task_id: 7,
            server_time: 1234,
            hmac: [3u8; 32],
            chain: vec![der_blob(b"leaf"), der_blob_long(300), der_blob(b"")],
            trace: "1.2.3.4\n5.6.7.8|5.6.7.9\n93.184.216.34".into(),
        });
        roundtrip(Message::TaskReplyNewCert {
            task_id: 8,
            server_time: 1,
            hmac: [0u8; 32],
            chain: vec![],
            trace: String::new(),
        });
        roundtrip(Message::TaskReplyKnownCert {
            task_id: 9,
            server_time: 99,
            hmac: [1u8; 32],
            cert_hash: sha256(b"cert"),
            trace: "t".repeat(4096),
        });
    }

    #[test]
    fn roundtrip_verify_request_and_result() {
        roundtrip(Message::CertVerifyRequest {
            options: 1,
            chain: vec![der_blob(b"leaf"), der_blob(b"issuer")],
            host: "www.example.com|93.184.216.34|443".into(),
        });
        roundtrip(Message::CertVerifyResult {
            rating: 170,
            report: "judgment line 1\njudgment line 2".into(),
        });
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let a = encode(&Message::CurrentServerTime { unix: 11 }).unwrap();
        let b = encode(&Message::CertVerifyResult {
            rating: 5,
            report: "r".into(),
        })
        .unwrap();
        let mut buf = a;
        buf.extend_from_slice(&b);
        let msgs = decode_all(&buf).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::CurrentServerTime { unix: 11 }));
        assert!(matches!(msgs[1], Message::CertVerifyResult { .. }));
    }

    #[test]
    fn truncated_final_frame_is_malformed() {
        let a = encode(&Message::CurrentServerTime { unix: 11 }).unwrap();
        let b = encode(&Message::CurrentServerTime { unix: 12 }).unwrap();
        let mut buf = a;
        buf.extend_from_slice(&b[..b.len() - 1]);
        assert!(matches!(
            decode_all(&buf),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn dangling_header_bytes_are_malformed() {
        let mut buf = encode(&Message::CurrentServerTime { unix: 11 }).unwrap();
        buf.extend_from_slice(&[5, 0]);
        assert!(matches!(decode_all(&buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let buf = [42u8, 0, 4, 0];
        assert_eq!(decode_all(&buf), Err(CodecError::UnknownType(42)));
    }

    #[test]
    fn length_below_header_is_malformed() {
        let buf = [0u8, 0, 2];
        assert!(matches!(decode_all(&buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let msg = Message::Signature {
            data: vec![0u8; 70_000],
        };
        assert_eq!(encode(&msg), Err(CodecError::Oversize));
    }

    #[test]
    fn chain_overrunning_frame_is_malformed() {
        // claims one cert whose DER length runs past the frame end
        let mut payload = vec![0u8, 1];
        payload.extend_from_slice(&[0x30, 0x7f, 1, 2, 3]);
        let mut buf = vec![MSG_CERT_VERIFY_REQUEST];
        buf.extend_from_slice(&((payload.len() + 3) as u16).to_be_bytes());
        buf.extend_from_slice(&payload);
        assert!(matches!(decode_all(&buf), Err(CodecError::Malformed(_))));
    }
}
