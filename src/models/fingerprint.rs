use std::time::Instant;

/// TLS ClientHello fingerprint captured at handshake time, keyed by remote
/// address in the Fingerprint Store (C1). `last_access` is advanced on
/// every `lookup` hit so the idle reaper can tell live connections from
/// abandoned ones.
#[derive(Debug, Clone)]
pub struct FingerprintEntry {
    pub ja3: String,
    pub ja4: String,
    pub last_access: Instant,
}

impl FingerprintEntry {
    pub fn new(ja3: String, ja4: String) -> Self {
        Self {
            ja3,
            ja4,
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn is_idle(&self, max_idle: std::time::Duration) -> bool {
        self.last_access.elapsed() > max_idle
    }
}
