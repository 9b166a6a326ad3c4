//! TLS termination for the phishing front end (C1, §4.1, §6).
//!
//! Certificates are loaded per-domain from `cert-dir/<domain>/{fullchain,
//! privkey}.pem` and served via SNI. The raw ClientHello bytes (sniffed by
//! the accept loop before the handshake proper, see `proxy::server`) are
//! parsed here into cipher suites / extensions / curves so the JA3 and JA4
//! fingerprints can be computed and handed to the Fingerprint Store.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

struct ClientHelloInfo {
    tls_version: u16,
    cipher_suites: Vec<u16>,
    extensions: Vec<u16>,
    elliptic_curves: Vec<u16>,
    ec_point_formats: Vec<u8>,
    signature_algorithms: Vec<u16>,
    alpn: Vec<String>,
    sni_present: bool,
}

/// SNI-keyed certificate resolver. Falls back to the first certificate
/// loaded (alphabetical directory order) when the client sends no SNI, or
/// an SNI hostname with no exact/parent-domain match.
#[derive(Debug)]
pub struct PhishCertResolver {
    certs: HashMap<String, Arc<CertifiedKey>>,
    default_cert: Option<Arc<CertifiedKey>>,
}

impl PhishCertResolver {
    /// Walks `cert-dir` for one subdirectory per domain, each holding
    /// `fullchain.pem` + `privkey.pem`. Directories missing either file are
    /// skipped with a warning rather than aborting the whole load.
    pub fn load_certs(cert_dir: &str) -> Self {
        let mut certs: HashMap<String, Arc<CertifiedKey>> = HashMap::new();
        let mut default_cert: Option<Arc<CertifiedKey>> = None;

        let entries = match fs::read_dir(cert_dir) {
            Ok(e) => e,
            Err(err) => {
                error!("failed to read certificate directory {}: {}", cert_dir, err);
                return Self { certs, default_cert };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let domain = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let cert_path = path.join("fullchain.pem");
            let key_path = path.join("privkey.pem");

            if !cert_path.exists() || !key_path.exists() {
                warn!("skipping {} - missing fullchain.pem or privkey.pem", path.display());
                continue;
            }

            match load_certified_key(&cert_path, &key_path) {
                Ok(certified_key) => {
                    let ck = Arc::new(certified_key);
                    if default_cert.is_none() {
                        default_cert = Some(Arc::clone(&ck));
                    }
                    info!(domain = %domain, "loaded TLS certificate");
                    certs.insert(domain, ck);
                }
                Err(err) => error!(domain = %domain, error = %err, "failed to load certificate"),
            }
        }

        info!(count = certs.len(), "TLS certificate resolver initialized");
        Self { certs, default_cert }
    }
}

impl ResolvesServerCert for PhishCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();

        if let Some(hostname) = sni {
            if let Some(ck) = self.certs.get(hostname) {
                return Some(Arc::clone(ck));
            }
            if let Some(dot_pos) = hostname.find('.') {
                let parent = &hostname[dot_pos + 1..];
                if let Some(ck) = self.certs.get(parent) {
                    return Some(Arc::clone(ck));
                }
            }
            warn!(hostname = %hostname, "no certificate matched SNI hostname, falling back to default");
        } else {
            warn!("client did not provide SNI, using default certificate");
        }

        self.default_cert.clone()
    }
}

fn load_certified_key(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<CertifiedKey, Box<dyn std::error::Error>> {
    let cert_file = fs::File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).filter_map(|r| r.ok()).collect();

    if certs.is_empty() {
        return Err(format!("no certificates found in {}", cert_path.display()).into());
    }

    let key_file = fs::File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let private_key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| format!("no private key found in {}", key_path.display()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// TLS 1.2/1.3 server config with SNI-based cert resolution. HTTP/1.1-only
/// ALPN (§9: HTTP/2 server push is out of scope for this engine).
pub fn build_tls_config(cert_dir: &str) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let resolver = PhishCertResolver::load_certs(cert_dir);

    let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[&TLS13, &TLS12])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn is_grease(v: u16) -> bool {
    (v & 0x0f0f) == 0x0a0a && ((v >> 8) == (v & 0xff))
}

/// Classic JA3 (Trustwave) fingerprint: MD5 of
/// `version,ciphers,extensions,curves,point_formats`, GREASE values
/// stripped from the three list fields.
pub fn extract_ja3_from_client_hello(buf: &[u8]) -> Option<String> {
    let info = parse_client_hello(buf)?;
    Some(ja3_digest(&info))
}

fn ja3_digest(info: &ClientHelloInfo) -> String {
    let join = |vals: &[u16]| -> String {
        vals.iter().copied().filter(|v| !is_grease(*v)).map(|v| v.to_string()).collect::<Vec<_>>().join("-")
    };
    let ciphers = join(&info.cipher_suites);
    let extensions = join(&info.extensions);
    let curves = join(&info.elliptic_curves);
    let point_formats: String = info.ec_point_formats.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("-");

    let ja3 = format!("{},{},{},{},{}", info.tls_version, ciphers, extensions, curves, point_formats);
    debug!(ja3_raw = %ja3, "computed JA3 raw string");
    md5_hex(ja3.as_bytes())
}

/// JA4 (FoxIO) fingerprint, computed from the same parsed ClientHello
/// (§4.1, §6 `X-JA4`, §9 glossary): `t13d0302h1_<ciphers-hash>_<ext-hash>`.
///
/// - `t`/`q` selects TCP vs QUIC (always `t` here, TLS-over-TCP only).
/// - TLS version is the two-digit code (`13`, `12`, `11`, `10`).
/// - `d`/`i` marks whether SNI was present.
/// - Two-digit cipher count and two-digit extension count follow
///   (GREASE values excluded from both counts, capped at 99).
/// - The ALPN field is the first and last byte of the first negotiated
///   protocol, or `00` when absent.
/// - `_a` is the truncated (first 12 hex chars) SHA-256 of the
///   GREASE-stripped cipher suites, sorted ascending, joined by `,`.
/// - `_b` is the truncated SHA-256 of the GREASE-stripped extensions
///   (SNI and ALPN excluded per the JA4 spec) sorted ascending, joined by
///   `,`, followed by `_` and the signature algorithms in their original
///   ClientHello order.
pub fn extract_ja4_from_client_hello(buf: &[u8]) -> Option<String> {
    let info = parse_client_hello(buf)?;
    Some(ja4_digest(&info))
}

fn ja4_digest(info: &ClientHelloInfo) -> String {
    let version_code = match info.tls_version {
        0x0304 => "13",
        0x0303 => "12",
        0x0302 => "11",
        0x0301 => "10",
        _ => "00",
    };
    let sni_flag = if info.sni_present { 'd' } else { 'i' };

    let ciphers: Vec<u16> = info.cipher_suites.iter().copied().filter(|c| !is_grease(*c)).collect();
    let mut ext_for_count: Vec<u16> = info.extensions.iter().copied().filter(|e| !is_grease(*e)).collect();

    let cipher_count = ciphers.len().min(99);
    let ext_count = ext_for_count.len().min(99);

    let alpn_field = info
        .alpn
        .first()
        .map(|proto| {
            let bytes = proto.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(first), Some(last)) => format!("{}{}", *first as char, *last as char),
                _ => "00".to_string(),
            }
        })
        .unwrap_or_else(|| "00".to_string());

    let ja4_a = format!("t{version_code}{sni_flag}{cipher_count:02}{ext_count:02}{alpn_field}");

    let mut sorted_ciphers = ciphers.clone();
    sorted_ciphers.sort_unstable();
    let cipher_list: String = sorted_ciphers.iter().map(|c| format!("{c:04x}")).collect::<Vec<_>>().join(",");
    let ja4_b = &sha256_hex(cipher_list.as_bytes())[..12];

    ext_for_count.retain(|e| *e != 0x0000 && *e != 0x0010);
    let mut sorted_exts = ext_for_count.clone();
    sorted_exts.sort_unstable();
    let ext_list: String = sorted_exts.iter().map(|e| format!("{e:04x}")).collect::<Vec<_>>().join(",");
    let sig_alg_list: String = info.signature_algorithms.iter().map(|s| format!("{s:04x}")).collect::<Vec<_>>().join(",");
    let ja4_c_input = format!("{ext_list}_{sig_alg_list}");
    let ja4_c = &sha256_hex(ja4_c_input.as_bytes())[..12];

    format!("{ja4_a}_{ja4_b}_{ja4_c}")
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hand-rolled MD5 (JA3 predates and is unrelated to any crypto-strength
/// requirement; no `md5`/`md-5` crate is in the dependency tree since JA3
/// is the only consumer).
fn md5_hex(data: &[u8]) -> String {
    const S: [u32; 64] = [
        7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 4, 11, 16, 23,
        4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
    ];
    const K: [u32; 64] = [
        0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501, 0x698098d8, 0x8b44f7af, 0xffff5bb1,
        0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821, 0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453,
        0xd8a1e681, 0xe7d3fbc8, 0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a, 0xfffa3942,
        0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70, 0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05,
        0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665, 0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d,
        0x85845dd1, 0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
    ];

    let mut a0: u32 = 0x67452301;
    let mut b0: u32 = 0xefcdab89;
    let mut c0: u32 = 0x98badcfe;
    let mut d0: u32 = 0x10325476;

    let orig_len_bits = (data.len() as u64) * 8;
    let mut msg = data.to_vec();
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0x00);
    }
    msg.extend_from_slice(&orig_len_bits.to_le_bytes());

    for chunk in msg.chunks_exact(64) {
        let mut m = [0u32; 16];
        for (i, word) in m.iter_mut().enumerate() {
            *word = u32::from_le_bytes([chunk[4 * i], chunk[4 * i + 1], chunk[4 * i + 2], chunk[4 * i + 3]]);
        }

        let (mut a, mut b, mut c, mut d) = (a0, b0, c0, d0);

        for i in 0..64u32 {
            let (f, g) = match i {
                0..=15 => ((b & c) | ((!b) & d), i as usize),
                16..=31 => ((d & b) | ((!d) & c), (5 * i as usize + 1) % 16),
                32..=47 => (b ^ c ^ d, (3 * i as usize + 5) % 16),
                _ => (c ^ (b | (!d)), (7 * i as usize) % 16),
            };

            let f = f.wrapping_add(a).wrapping_add(K[i as usize]).wrapping_add(m[g]);
            a = d;
            d = c;
            c = b;
            b = b.wrapping_add(f.rotate_left(S[i as usize]));
        }

        a0 = a0.wrapping_add(a);
        b0 = b0.wrapping_add(b);
        c0 = c0.wrapping_add(c);
        d0 = d0.wrapping_add(d);
    }

    [a0.to_le_bytes(), b0.to_le_bytes(), c0.to_le_bytes(), d0.to_le_bytes()]
        .concat()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hand-walks the ClientHello record without a full TLS-parsing crate: the
/// sniff happens before the handshake is handed to rustls, on the raw
/// bytes peeked off the socket (see `proxy::server`).
fn parse_client_hello(data: &[u8]) -> Option<ClientHelloInfo> {
    let mut pos: usize = 0;

    if data.len() < 5 {
        return None;
    }
    let content_type = data[pos];
    pos += 1;
    if content_type != 0x16 {
        return None;
    }
    pos += 2;
    let record_len = read_u16(data, &mut pos)? as usize;
    if data.len() < pos + record_len {
        return None;
    }

    let handshake_type = read_u8(data, &mut pos)?;
    if handshake_type != 0x01 {
        return None;
    }
    let _handshake_len = read_u24(data, &mut pos)?;

    let tls_version = read_u16(data, &mut pos)?;

    if pos + 32 > data.len() {
        return None;
    }
    pos += 32;

    let session_id_len = read_u8(data, &mut pos)? as usize;
    if pos + session_id_len > data.len() {
        return None;
    }
    pos += session_id_len;

    let cs_len = read_u16(data, &mut pos)? as usize;
    if pos + cs_len > data.len() || cs_len % 2 != 0 {
        return None;
    }
    let mut cipher_suites = Vec::with_capacity(cs_len / 2);
    let cs_end = pos + cs_len;
    while pos < cs_end {
        cipher_suites.push(read_u16(data, &mut pos)?);
    }

    let comp_len = read_u8(data, &mut pos)? as usize;
    if pos + comp_len > data.len() {
        return None;
    }
    pos += comp_len;

    let mut extensions: Vec<u16> = Vec::new();
    let mut elliptic_curves: Vec<u16> = Vec::new();
    let mut ec_point_formats: Vec<u8> = Vec::new();
    let mut signature_algorithms: Vec<u16> = Vec::new();
    let mut alpn: Vec<String> = Vec::new();
    let mut sni_present = false;

    if pos + 2 <= data.len() {
        let ext_total_len = read_u16(data, &mut pos)? as usize;
        let ext_end = pos + ext_total_len;
        if ext_end > data.len() {
            return None;
        }

        while pos + 4 <= ext_end {
            let ext_type = read_u16(data, &mut pos)?;
            let ext_data_len = read_u16(data, &mut pos)? as usize;
            if pos + ext_data_len > ext_end {
                return None;
            }
            let ext_data_start = pos;
            pos += ext_data_len;

            extensions.push(ext_type);

            match ext_type {
                0x0000 => sni_present = true,
                0x000a => {
                    let mut epos = ext_data_start;
                    if epos + 2 <= pos {
                        let list_len = read_u16(data, &mut epos)? as usize;
                        let list_end = epos + list_len;
                        while epos + 2 <= list_end && epos + 2 <= data.len() {
                            elliptic_curves.push(read_u16(data, &mut epos)?);
                        }
                    }
                }
                0x000b => {
                    let mut epos = ext_data_start;
                    if epos + 1 <= pos {
                        let fmt_len = read_u8(data, &mut epos)? as usize;
                        let fmt_end = epos + fmt_len;
                        while epos < fmt_end && epos < data.len() {
                            ec_point_formats.push(read_u8(data, &mut epos)?);
                        }
                    }
                }
                0x000d => {
                    let mut epos = ext_data_start;
                    if epos + 2 <= pos {
                        let list_len = read_u16(data, &mut epos)? as usize;
                        let list_end = epos + list_len;
                        while epos + 2 <= list_end && epos + 2 <= data.len() {
                            signature_algorithms.push(read_u16(data, &mut epos)?);
                        }
                    }
                }
                0x0010 => {
                    let mut epos = ext_data_start;
                    if epos + 2 <= pos {
                        let list_len = read_u16(data, &mut epos)? as usize;
                        let list_end = (epos + 2 + list_len).min(pos);
                        epos += 2;
                        while epos < list_end && epos < data.len() {
                            let Some(proto_len) = read_u8(data, &mut epos) else { break };
                            let proto_len = proto_len as usize;
                            if epos + proto_len > data.len() {
                                break;
                            }
                            if let Ok(proto) = std::str::from_utf8(&data[epos..epos + proto_len]) {
                                alpn.push(proto.to_string());
                            }
                            epos += proto_len;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Some(ClientHelloInfo {
        tls_version,
        cipher_suites,
        extensions,
        elliptic_curves,
        ec_point_formats,
        signature_algorithms,
        alpn,
        sni_present,
    })
}

#[inline]
fn read_u8(data: &[u8], pos: &mut usize) -> Option<u8> {
    if *pos >= data.len() {
        return None;
    }
    let v = data[*pos];
    *pos += 1;
    Some(v)
}

#[inline]
fn read_u16(data: &[u8], pos: &mut usize) -> Option<u16> {
    if *pos + 2 > data.len() {
        return None;
    }
    let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    Some(v)
}

#[inline]
fn read_u24(data: &[u8], pos: &mut usize) -> Option<u32> {
    if *pos + 3 > data.len() {
        return None;
    }
    let v = (data[*pos] as u32) << 16 | (data[*pos + 1] as u32) << 8 | (data[*pos + 2] as u32);
    *pos += 3;
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello() -> Vec<u8> {
        let mut handshake = Vec::new();
        handshake.push(0x01); // client hello
        handshake.extend_from_slice(&[0, 0, 0]); // length placeholder, fixed below

        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes()); // legacy version (TLS 1.2)
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        let ciphers: [u16; 3] = [0x1301, 0x1302, 0x0a0a]; // includes a GREASE value
        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.push(1); // compression methods len
        body.push(0);

        let mut extensions = Vec::new();
        // SNI extension (type 0, minimal empty body is fine for this parser)
        extensions.extend_from_slice(&0x0000u16.to_be_bytes());
        extensions.extend_from_slice(&0u16.to_be_bytes());
        // supported_groups (curves)
        let curves: [u16; 2] = [0x001d, 0x0017];
        let mut curve_body = Vec::new();
        curve_body.extend_from_slice(&((curves.len() * 2) as u16).to_be_bytes());
        for c in curves {
            curve_body.extend_from_slice(&c.to_be_bytes());
        }
        extensions.extend_from_slice(&0x000au16.to_be_bytes());
        extensions.extend_from_slice(&(curve_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&curve_body);

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        handshake.extend_from_slice(&body);
        let handshake_len = (handshake.len() - 4) as u32;
        handshake[1] = ((handshake_len >> 16) & 0xff) as u8;
        handshake[2] = ((handshake_len >> 8) & 0xff) as u8;
        handshake[3] = (handshake_len & 0xff) as u8;

        let mut record = Vec::new();
        record.push(0x16); // handshake content type
        record.extend_from_slice(&0x0301u16.to_be_bytes()); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn ja3_is_computed_from_a_well_formed_client_hello() {
        let ja3 = extract_ja3_from_client_hello(&sample_client_hello());
        assert!(ja3.is_some());
        assert_eq!(ja3.unwrap().len(), 32, "MD5 hex digest is always 32 chars");
    }

    #[test]
    fn ja4_has_the_expected_field_shape() {
        let ja4 = extract_ja4_from_client_hello(&sample_client_hello()).unwrap();
        let parts: Vec<&str> = ja4.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("t13d") || parts[0].starts_with("t12d"));
        assert_eq!(parts[1].len(), 12);
        assert_eq!(parts[2].len(), 12);
    }

    #[test]
    fn truncated_buffer_does_not_panic() {
        assert!(extract_ja3_from_client_hello(&[0x16, 0x03, 0x01]).is_none());
        assert!(extract_ja4_from_client_hello(&[]).is_none());
    }

    #[test]
    fn ja4_is_stable_for_identical_input() {
        let hello = sample_client_hello();
        assert_eq!(extract_ja4_from_client_hello(&hello), extract_ja4_from_client_hello(&hello));
    }
}
