use zeroize::Zeroizing;

use super::StorageError;

pub const MAGIC_NUMBER: [u8; 4] = *b"ASYC";
pub const VERSION: u8 = 0x01;
/// XChaCha20-Poly1305, clé dérivée par HKDF-SHA256.
pub const CIPHER_ID: u8 = 0x01;

const SALT_LEN: usize = 32;
const COMMITMENT_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const HEADER_SIZE: usize = 4 + 1 + 1 + SALT_LEN + COMMITMENT_LEN + NONCE_LEN; // 94 bytes
const LEN_SIZE: usize = 8; // u64

/// En-tête binaire d'une entrée de cache scellée.
///
/// Structure :
/// - Magic Number (4 bytes): "ASYC"
/// - Version (1 byte): 0x01
/// - Cipher ID (1 byte): 0x01
/// - Salt (32 bytes): salt de dérivation de la clé d'entrée
/// - Commitment (32 bytes): engagement SHA-256 sur l'en-tête et la clé d'entrée
/// - Nonce (24 bytes): nonce XChaCha20-Poly1305
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub cipher_id: u8,
    pub salt: [u8; SALT_LEN],
    pub commitment: [u8; COMMITMENT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

/// Entrée scellée complète (en-tête + corps chiffré), telle que stockée en base.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub header: BlobHeader,
    pub ciphertext: Zeroizing<Vec<u8>>,
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], StorageError> {
        let end = self.offset + N;
        let slice = self.data.get(self.offset..end).ok_or(StorageError::InvalidHeader)?;
        self.offset = end;
        slice.try_into().map_err(|_| StorageError::InvalidHeader)
    }
}

impl SealedBlob {
    /// Format binaire :
    /// [Magic(4)][Version(1)][CipherID(1)][Salt(32)][Commitment(32)][Nonce(24)][CiphertextLen(8)][Ciphertext(N)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + LEN_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header.magic);
        bytes.push(self.header.version);
        bytes.push(self.header.cipher_id);
        bytes.extend_from_slice(&self.header.salt);
        bytes.extend_from_slice(&self.header.commitment);
        bytes.extend_from_slice(&self.header.nonce);

        // Longueur du ciphertext (u64 en little-endian)
        bytes.extend_from_slice(&(self.ciphertext.len() as u64).to_le_bytes());
        bytes.extend_from_slice(self.ciphertext.as_ref());
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < HEADER_SIZE + LEN_SIZE {
            return Err(StorageError::InvalidHeader);
        }

        let mut reader = Reader { data, offset: 0 };
        let magic = reader.take::<4>()?;
        let [version] = reader.take::<1>()?;
        let [cipher_id] = reader.take::<1>()?;
        let salt = reader.take::<SALT_LEN>()?;
        let commitment = reader.take::<COMMITMENT_LEN>()?;
        let nonce = reader.take::<NONCE_LEN>()?;
        let ciphertext_len = u64::from_le_bytes(reader.take::<LEN_SIZE>()?) as usize;

        // Les données restantes doivent correspondre exactement à la longueur annoncée.
        let body = &data[reader.offset..];
        if body.len() != ciphertext_len {
            return Err(StorageError::InvalidHeader);
        }

        Ok(SealedBlob {
            header: BlobHeader {
                magic,
                version,
                cipher_id,
                salt,
                commitment,
                nonce,
            },
            ciphertext: Zeroizing::new(body.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SealedBlob {
        SealedBlob {
            header: BlobHeader {
                magic: MAGIC_NUMBER,
                version: VERSION,
                cipher_id: CIPHER_ID,
                salt: [0x02; SALT_LEN],
                commitment: [0x03; COMMITMENT_LEN],
                nonce: [0x04; NONCE_LEN],
            },
            ciphertext: Zeroizing::new(vec![0x05; 100]),
        }
    }

    #[test]
    fn serialized_layout_is_stable() {
        let blob = sample();
        let bytes = blob.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + LEN_SIZE + 100);
        assert_eq!(&bytes[..4], b"ASYC");

        let parsed = SealedBlob::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header, blob.header);
        assert_eq!(parsed.ciphertext.as_slice(), blob.ciphertext.as_slice());
    }

    #[test]
    fn truncated_or_padded_input_is_rejected() {
        let bytes = sample().to_bytes();
        assert!(SealedBlob::from_bytes(&bytes[..HEADER_SIZE]).is_err());
        assert!(SealedBlob::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(SealedBlob::from_bytes(&padded).is_err());
    }
}
