use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use ring::digest;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes128Ctr = ctr::Ctr128LE<aes::Aes128>;

/// AES-128 key and block width.
pub const SYMMETRIC_KEY_SIZE: usize = 16;
/// Truncated-SHA-256 packet signature width.
pub const MAC_SIZE: usize = 5;
/// X25519 public key width on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Keystream bytes reserved per send sequence for connected-protocol packets;
/// comfortably larger than any datagram so per-packet streams never overlap.
const PACKET_KEYSTREAM_STRIDE: u64 = 1536;
/// Keystream bytes reserved per handshake packet type, so the connect-request,
/// connect-accept, and disconnect payloads of one connection draw from
/// disjoint parts of the shared-secret keystream.
const HANDSHAKE_KEYSTREAM_STRIDE: u64 = 4096;

/// An X25519 keypair.
///
/// The secret is importable and exportable as a 32-byte blob so a socket can
/// present a stable identity across restarts; a keypair is otherwise generated
/// fresh from the socket's RNG.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0; 32];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// SHA-256 of the ECDH output with the peer's public key; the root secret
    /// for everything the connection encrypts or signs.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Option<[u8; 32]> {
        if peer_public.len() != PUBLIC_KEY_SIZE {
            return None;
        }
        let mut bytes = [0; 32];
        bytes.copy_from_slice(peer_public);
        let peer = PublicKey::from(bytes);
        let ecdh = self.secret.diffie_hellman(&peer);
        let hash = digest::digest(&digest::SHA256, ecdh.as_bytes());
        let mut secret = [0; 32];
        secret.copy_from_slice(hash.as_ref());
        Some(secret)
    }
}

/// Truncated SHA-256 over the secret and the packet bytes.
pub fn packet_mac(secret: &[u8; 32], parts: &[&[u8]]) -> [u8; MAC_SIZE] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(secret);
    for part in parts {
        ctx.update(part);
    }
    let hash = ctx.finish();
    let mut mac = [0; MAC_SIZE];
    mac.copy_from_slice(&hash.as_ref()[..MAC_SIZE]);
    mac
}

fn handshake_cipher(secret: &[u8; 32], packet_type: u8) -> Aes128Ctr {
    let mut cipher =
        Aes128Ctr::new_from_slices(&secret[..SYMMETRIC_KEY_SIZE], &secret[SYMMETRIC_KEY_SIZE..])
            .expect("shared secret halves are cipher-sized");
    cipher.seek(u64::from(packet_type) * HANDSHAKE_KEYSTREAM_STRIDE);
    cipher
}

/// Signs and encrypts the secret tail of a handshake packet in place.
///
/// The MAC covers the whole cleartext packet; the bytes from `secret_from`
/// onward, MAC included, are then encrypted under a keystream keyed directly
/// from the shared secret.
pub fn seal_handshake(packet: &mut Vec<u8>, secret_from: usize, secret: &[u8; 32]) {
    debug_assert!(secret_from <= packet.len() && !packet.is_empty());
    let mac = packet_mac(secret, &[&packet[..]]);
    packet.extend_from_slice(&mac);
    let packet_type = packet[0];
    handshake_cipher(secret, packet_type).apply_keystream(&mut packet[secret_from..]);
}

/// Reverses `seal_handshake`; returns false if the signature does not verify.
/// On success the packet is left decrypted with the MAC trimmed off.
pub fn open_handshake(packet: &mut Vec<u8>, secret_from: usize, secret: &[u8; 32]) -> bool {
    if packet.len() < secret_from + MAC_SIZE || packet.is_empty() {
        return false;
    }
    let packet_type = packet[0];
    handshake_cipher(secret, packet_type).apply_keystream(&mut packet[secret_from..]);
    let body_len = packet.len() - MAC_SIZE;
    let expected = packet_mac(secret, &[&packet[..body_len]]);
    if !constant_time_eq(&expected, &packet[body_len..]) {
        return false;
    }
    packet.truncate(body_len);
    true
}

/// The connected-protocol payload cipher.
///
/// One AES-128-CTR keystream per connection, keyed by the symmetric key the
/// initiator chose and the init vector the host chose. Every packet seeks to a
/// position derived from its send sequence and direction, so no keystream
/// block is ever reused within the connection's lifetime.
pub struct PacketCipher {
    cipher: Aes128Ctr,
}

impl PacketCipher {
    pub fn new(key: &[u8; SYMMETRIC_KEY_SIZE], init_vector: &[u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self {
            cipher: Aes128Ctr::new(key.into(), init_vector.into()),
        }
    }

    pub fn apply(&mut self, sequence: u32, from_initiator: bool, data: &mut [u8]) {
        debug_assert!(data.len() as u64 <= PACKET_KEYSTREAM_STRIDE);
        let lane = u64::from(!from_initiator as u8) << 32 | u64::from(sequence);
        self.cipher.seek(lane * PACKET_KEYSTREAM_STRIDE);
        self.cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 7748 section 6.1 test vectors.
    const ALICE_SECRET: [u8; 32] =
        hex!("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
    const BOB_SECRET: [u8; 32] =
        hex!("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb");

    #[test]
    fn x25519_known_vectors() {
        let alice = KeyPair::from_bytes(ALICE_SECRET);
        let bob = KeyPair::from_bytes(BOB_SECRET);
        assert_eq!(
            alice.public_bytes(),
            hex!("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );
        assert_eq!(
            bob.public_bytes(),
            hex!("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
        );
        let a = alice.shared_secret(&bob.public_bytes()).unwrap();
        let b = bob.shared_secret(&alice.public_bytes()).unwrap();
        assert_eq!(a, b);
        // SHA-256 of the raw ECDH output, not the raw output itself.
        assert_ne!(
            &a[..],
            &hex!("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")[..]
        );
    }

    #[test]
    fn shared_secret_rejects_bad_key_length() {
        let alice = KeyPair::from_bytes(ALICE_SECRET);
        assert!(alice.shared_secret(&[0; 31]).is_none());
        assert!(alice.shared_secret(&[0; 33]).is_none());
    }

    #[test]
    fn seal_open_round_trip() {
        let secret = [0x42; 32];
        let mut packet = vec![2u8, 1, 2, 3, 4, 5, 6, 7, 8];
        let clear = packet.clone();
        seal_handshake(&mut packet, 5, &secret);
        assert_ne!(&packet[5..9], &clear[5..9]);
        assert!(open_handshake(&mut packet, 5, &secret));
        assert_eq!(packet, clear);
    }

    #[test]
    fn open_rejects_tampering() {
        let secret = [0x42; 32];
        let mut packet = vec![2u8, 1, 2, 3, 4, 5, 6, 7, 8];
        seal_handshake(&mut packet, 5, &secret);
        packet[6] ^= 0x10;
        assert!(!open_handshake(&mut packet, 5, &secret));
    }

    #[test]
    fn open_rejects_wrong_secret() {
        let secret = [0x42; 32];
        let mut packet = vec![2u8, 1, 2, 3, 4, 5, 6, 7, 8];
        seal_handshake(&mut packet, 5, &secret);
        assert!(!open_handshake(&mut packet, 5, &[0x43; 32]));
    }

    #[test]
    fn packet_cipher_lanes_are_disjoint() {
        let mut cipher = PacketCipher::new(&[1; 16], &[2; 16]);
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let mut c = [0u8; 32];
        cipher.apply(7, true, &mut a);
        cipher.apply(7, false, &mut b);
        cipher.apply(8, true, &mut c);
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Same sequence and direction reproduces the same keystream.
        let mut again = [0u8; 32];
        cipher.apply(7, true, &mut again);
        assert_eq!(a, again);
    }
}
