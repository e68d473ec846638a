//! Key derivation toolbox for the commissioning Security Manager
//!
//! AES-CMAC (RFC 4493) plus the three derivation functions used by the
//! handshake:
//! - `f1` per-iteration authentication code
//! - `f2` confirmation key and device key from the ECDH shared secret
//! - `f3` security check value compared during key generation
//!
//! Callers hold every value least significant byte first. Each function
//! reverses its inputs into the big-endian order the CMAC definitions use
//! and reverses the result back before returning it.

use super::constants::*;
use super::error::SmResult;
use aes::{
    cipher::{BlockEncrypt, KeyInit},
    Aes128,
};

/// Single-block AES-128 encryption, the only primitive CMAC needs
pub trait AesBlockCipher {
    /// Encrypt one 16-byte block with a 128-bit key (ECB, no padding)
    fn aes_ecb_encrypt_block(&self, key: &[u8; 16], block: &[u8; 16]) -> SmResult<[u8; 16]>;
}

/// Software AES-128 backed by the `aes` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareAes;

impl AesBlockCipher for SoftwareAes {
    fn aes_ecb_encrypt_block(&self, key: &[u8; 16], block: &[u8; 16]) -> SmResult<[u8; 16]> {
        let cipher = Aes128::new(key.into());
        let mut block_ga = aes::cipher::generic_array::GenericArray::from(*block);
        cipher.encrypt_block(&mut block_ga);
        Ok(block_ga.into())
    }
}

/// Keys produced by `f2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedKeys {
    /// Confirmation key (counter 0), keys `f3`
    pub confirm_key: [u8; SM_KEY_LEN],
    /// Device key (counter 1), installed in the MAC key table
    pub device_key: [u8; SM_KEY_LEN],
}

/// Copy `src` into `dst` in reverse byte order
fn copy_reversed(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
        *d = *s;
    }
}

fn reversed<const N: usize>(input: &[u8; N]) -> [u8; N] {
    let mut out = *input;
    out.reverse();
    out
}

fn xor_in_place(dst: &mut [u8; 16], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// Left shift by one bit, folding in Rb when the top bit falls off
fn double_block(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut carry = 0u8;
    for i in (0..16).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if block[0] & 0x80 != 0 {
        out[15] ^= 0x87;
    }
    out
}

/// Generate the CMAC subkeys K1 and K2 for `key`
pub fn generate_subkeys<C: AesBlockCipher + ?Sized>(
    cipher: &C,
    key: &[u8; 16],
) -> SmResult<([u8; 16], [u8; 16])> {
    let l = cipher.aes_ecb_encrypt_block(key, &[0u8; 16])?;
    let k1 = double_block(&l);
    let k2 = double_block(&k1);
    Ok((k1, k2))
}

/// AES-CMAC over `message` (RFC 4493), both in big-endian order
pub fn aes_cmac<C: AesBlockCipher + ?Sized>(
    cipher: &C,
    key: &[u8; 16],
    message: &[u8],
) -> SmResult<[u8; 16]> {
    let (k1, k2) = generate_subkeys(cipher, key)?;

    let blocks = if message.is_empty() {
        1
    } else {
        (message.len() + 15) / 16
    };
    let tail_start = (blocks - 1) * 16;
    let tail = &message[tail_start..];

    let mut last = [0u8; 16];
    if tail.len() == 16 {
        last.copy_from_slice(tail);
        xor_in_place(&mut last, &k1);
    } else {
        last[..tail.len()].copy_from_slice(tail);
        last[tail.len()] = 0x80;
        xor_in_place(&mut last, &k2);
    }

    let mut x = [0u8; 16];
    for chunk in message[..tail_start].chunks(16) {
        xor_in_place(&mut x, chunk);
        x = cipher.aes_ecb_encrypt_block(key, &x)?;
    }
    xor_in_place(&mut x, &last);
    cipher.aes_ecb_encrypt_block(key, &x)
}

/// f1: authentication code for one iteration.
///
/// `u` and `v` are the public-key x-coordinates of the generator and the
/// verifier, `x` the nonce and `z` the passkey slice.
pub fn f1<C: AesBlockCipher + ?Sized>(
    cipher: &C,
    u: &[u8; SM_ECC_KEY_LEN],
    v: &[u8; SM_ECC_KEY_LEN],
    x: &[u8; SM_AUTH_NONCE_LEN],
    z: u8,
) -> SmResult<[u8; SM_KEY_LEN]> {
    let mut input = [0u8; SM_F1_INPUT_LEN];
    copy_reversed(&mut input[..SM_ECC_KEY_LEN], u);
    copy_reversed(&mut input[SM_ECC_KEY_LEN..2 * SM_ECC_KEY_LEN], v);
    input[2 * SM_ECC_KEY_LEN] = z;

    let out = aes_cmac(cipher, &reversed(x), &input)?;
    Ok(reversed(&out))
}

/// f2: derive the confirmation key and the device key.
///
/// `w` is the x-coordinate of the ECDH shared secret, `n1`/`n2` the folded
/// nonces and `a1`/`a2` the truncated extended addresses.
pub fn f2<C: AesBlockCipher + ?Sized>(
    cipher: &C,
    w: &[u8; SM_ECC_KEY_LEN],
    n1: &[u8; SM_KEY_LEN],
    n2: &[u8; SM_KEY_LEN],
    a1: &[u8; SM_ADDRESS_LEN],
    a2: &[u8; SM_ADDRESS_LEN],
) -> SmResult<DerivedKeys> {
    let t = aes_cmac(cipher, &SM_F2_SALT, &reversed(w))?;

    let mut input = [0u8; SM_F2_INPUT_LEN];
    let mut offset = 1;
    input[offset..offset + 4].copy_from_slice(&SM_F2_KEY_ID);
    offset += 4;
    copy_reversed(&mut input[offset..offset + SM_KEY_LEN], n1);
    offset += SM_KEY_LEN;
    copy_reversed(&mut input[offset..offset + SM_KEY_LEN], n2);
    offset += SM_KEY_LEN;
    copy_reversed(&mut input[offset..offset + SM_ADDRESS_LEN], a1);
    offset += SM_ADDRESS_LEN;
    copy_reversed(&mut input[offset..offset + SM_ADDRESS_LEN], a2);
    offset += SM_ADDRESS_LEN;
    input[offset..offset + 2].copy_from_slice(&SM_F2_LENGTH);

    // Only the counter byte differs between the two keys
    input[0] = 0;
    let confirm_key = aes_cmac(cipher, &t, &input)?;
    input[0] = 1;
    let device_key = aes_cmac(cipher, &t, &input)?;

    Ok(DerivedKeys {
        confirm_key: reversed(&confirm_key),
        device_key: reversed(&device_key),
    })
}

/// f3: security check value exchanged during key generation
#[allow(clippy::too_many_arguments)]
pub fn f3<C: AesBlockCipher + ?Sized>(
    cipher: &C,
    w: &[u8; SM_KEY_LEN],
    n1: &[u8; SM_KEY_LEN],
    n2: &[u8; SM_KEY_LEN],
    r: &[u8; SM_PASSKEY_BUF_LEN],
    au: &[u8; SM_AUTH_METHOD_BUF_LEN],
    a1: &[u8; SM_ADDRESS_LEN],
    a2: &[u8; SM_ADDRESS_LEN],
) -> SmResult<[u8; SM_KEY_LEN]> {
    let mut input = [0u8; SM_F3_INPUT_LEN];
    let mut offset = 0;
    for field in [&n1[..], &n2[..], &r[..], &au[..], &a1[..], &a2[..]] {
        copy_reversed(&mut input[offset..offset + field.len()], field);
        offset += field.len();
    }

    let out = aes_cmac(cipher, &reversed(w), &input)?;
    Ok(reversed(&out))
}

/// Passkey bits tested in `iteration` when `width` bits are tested at a time
pub fn passkey_slice(passkey: u32, iteration: usize, width: u8) -> u8 {
    let shift = iteration * width as usize;
    if shift >= 32 {
        return 0;
    }
    let mask = (1u32 << width) - 1;
    ((passkey >> shift) & mask) as u8
}
