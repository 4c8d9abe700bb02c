// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM quote wire format and native quote verification

use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use nom::{
    bytes::complete::take,
    multi::count,
    number::complete::{be_u16, be_u32, be_u64, be_u8, le_u16, le_u32, le_u64, le_u8},
    sequence::pair,
    IResult,
};
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tpm_types::{ClockInfo, HashAlg, PcrValues, TPM_ALG_SHA256};
use tracing::{debug, warn};

use crate::collaborators::QuoteVerifier;

const TPM_GENERATED_VALUE: u32 = 0xff544347;
const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;
const TPM_ALG_RSASSA: u16 = 0x0014;
const TPM_ALG_ECDSA: u16 = 0x0018;

/// Number of TPMS_PCR_SELECTION slots in a TPML_PCR_SELECTION
const TPM2_NUM_PCR_BANKS: usize = 16;
/// Number of TPML_DIGEST lists `tpm2_quote` can write
const TPM2_MAX_PCR_LISTS: u64 = 32;
const TPML_DIGEST_SLOTS: usize = 8;
const TPMU_HA_SIZE: usize = 64;

/// Decoded parts of an `r<quote>:<signature>:<pcrs>` quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteBlobs {
    /// TPMS_ATTEST
    pub quote: Vec<u8>,
    /// TPMT_SIGNATURE
    pub signature: Vec<u8>,
    /// `tpm2_quote` PCR output
    pub pcrs: Vec<u8>,
}

impl QuoteBlobs {
    pub fn parse(quote: &str, compressed: bool) -> Result<Self> {
        let Some(body) = quote.strip_prefix('r') else {
            bail!(
                "invalid quote type {}",
                quote.chars().next().map(String::from).unwrap_or_default()
            );
        };
        let tokens: Vec<&str> = body.split(':').collect();
        if tokens.len() < 3 {
            bail!("quote is not compound");
        }

        let decode = |token: &str, what: &str| {
            STANDARD
                .decode(token)
                .with_context(|| format!("invalid base64 in {what} blob"))
        };
        let mut blobs = Self {
            quote: decode(tokens[0], "quote")?,
            signature: decode(tokens[1], "signature")?,
            pcrs: decode(tokens[2], "PCR")?,
        };

        if compressed {
            warn!("decompressing quote data which is unsafe!");
            blobs.quote = inflate(&blobs.quote).context("failed to decompress quote blob")?;
            blobs.signature =
                inflate(&blobs.signature).context("failed to decompress signature blob")?;
            blobs.pcrs = inflate(&blobs.pcrs).context("failed to decompress PCR blob")?;
        }
        Ok(blobs)
    }
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct TpmAttest {
    pub magic: u32,
    pub type_: u16,
    pub qualified_signer: Vec<u8>,
    /// Caller nonce (`extraData`)
    pub qualified_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub attested_quote_info: QuoteInfo,
}

/// PCR selection of one bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    /// TPM_ALG_ID of the bank
    pub hash_alg: u16,
    pub pcr_indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct QuoteInfo {
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

fn selected_indices(bitmap: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        for bit_idx in 0..8 {
            if (byte & (1 << bit_idx)) != 0 {
                indices.push((byte_idx * 8 + bit_idx) as u32);
            }
        }
    }
    indices
}

pub fn parse_tpm_attest(data: &[u8]) -> Result<TpmAttest> {
    fn parse_sized_buffer(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (input, size) = be_u16(input)?;
        let (input, data) = take(size)(input)?;
        Ok((input, data.to_vec()))
    }

    fn parse_selection(input: &[u8]) -> IResult<&[u8], PcrSelection> {
        let (input, hash_alg) = be_u16(input)?;
        let (input, sizeof_select) = be_u8(input)?;
        let (input, bitmap) = take(sizeof_select)(input)?;
        Ok((
            input,
            PcrSelection {
                hash_alg,
                pcr_indices: selected_indices(bitmap),
            },
        ))
    }

    fn parse_attest(input: &[u8]) -> IResult<&[u8], TpmAttest> {
        let (input, magic) = be_u32(input)?;
        let (input, type_) = be_u16(input)?;
        let (input, qualified_signer) = parse_sized_buffer(input)?;
        let (input, qualified_data) = parse_sized_buffer(input)?;

        let (input, clock) = be_u64(input)?;
        let (input, reset_count) = be_u32(input)?;
        let (input, restart_count) = be_u32(input)?;
        let (input, safe) = be_u8(input)?;

        let (input, firmware_version) = be_u64(input)?;

        let (input, pcr_select_count) = be_u32(input)?;
        let (input, pcr_selections) = count(parse_selection, pcr_select_count as usize)(input)?;
        let (input, pcr_digest) = parse_sized_buffer(input)?;

        Ok((
            input,
            TpmAttest {
                magic,
                type_,
                qualified_signer,
                qualified_data,
                clock_info: ClockInfo {
                    clock,
                    reset_count,
                    restart_count,
                    safe: safe == 1,
                },
                firmware_version,
                attested_quote_info: QuoteInfo {
                    pcr_selections,
                    pcr_digest,
                },
            },
        ))
    }

    let (_, attest) = parse_attest(data).map_err(|e| anyhow!("parse error: {e}"))?;

    if attest.magic != TPM_GENERATED_VALUE {
        bail!("invalid magic number: 0x{magic:08x}", magic = attest.magic);
    }

    if attest.type_ != TPM_ST_ATTEST_QUOTE {
        bail!("invalid attest type: 0x{type_:04x}", type_ = attest.type_);
    }

    Ok(attest)
}

/// PCR values of one bank, in selection order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrBank {
    pub hash_alg: u16,
    pub values: Vec<(u32, Vec<u8>)>,
}

impl PcrBank {
    fn selection(&self) -> PcrSelection {
        PcrSelection {
            hash_alg: self.hash_alg,
            pcr_indices: self.values.iter().map(|(index, _)| *index).collect(),
        }
    }
}

/// Parse the PCR file written by `tpm2_quote -o`
///
/// The file is the in-memory `tpm2_pcrs` layout on a little-endian 64-bit
/// host: a full TPML_PCR_SELECTION, a `size_t` list count and that many
/// fixed-size TPML_DIGEST lists. Digests are handed out to the selected
/// PCRs in selection order.
pub fn parse_pcr_blob(data: &[u8]) -> Result<Vec<PcrBank>> {
    type Slot<'a> = (u16, u8, &'a [u8]);

    fn parse_slot(input: &[u8]) -> IResult<&[u8], Slot<'_>> {
        let (input, hash_alg) = le_u16(input)?;
        let (input, sizeof_select) = le_u8(input)?;
        let (input, select) = take(4usize)(input)?;
        let (input, _pad) = take(1usize)(input)?;
        Ok((input, (hash_alg, sizeof_select, select)))
    }

    fn parse_header(input: &[u8]) -> IResult<&[u8], (u32, Vec<Slot<'_>>, u64)> {
        let (input, select_count) = le_u32(input)?;
        let (input, slots) = count(parse_slot, TPM2_NUM_PCR_BANKS)(input)?;
        let (input, _pad) = take(4usize)(input)?;
        let (input, list_count) = le_u64(input)?;
        Ok((input, (select_count, slots, list_count)))
    }

    fn parse_digest_list(input: &[u8]) -> IResult<&[u8], (u32, Vec<(u16, &[u8])>)> {
        let (input, n) = le_u32(input)?;
        let (input, digests) =
            count(pair(le_u16, take(TPMU_HA_SIZE)), TPML_DIGEST_SLOTS)(input)?;
        Ok((input, (n, digests)))
    }

    let (rest, (select_count, slots, list_count)) =
        parse_header(data).map_err(|e| anyhow!("parse error: {e}"))?;
    if select_count as usize > TPM2_NUM_PCR_BANKS {
        bail!("too many PCR selections: {select_count}");
    }
    if list_count > TPM2_MAX_PCR_LISTS {
        bail!("too many PCR digest lists: {list_count}");
    }
    let (_, lists) = count(parse_digest_list, list_count as usize)(rest)
        .map_err(|e| anyhow!("parse error: {e}"))?;

    let mut digests = Vec::new();
    for (n, entries) in lists {
        if n as usize > TPML_DIGEST_SLOTS {
            bail!("too many digests in list: {n}");
        }
        for (size, buffer) in entries.into_iter().take(n as usize) {
            let size = size as usize;
            if size > TPMU_HA_SIZE {
                bail!("digest too large: {size} bytes");
            }
            digests.push(buffer[..size].to_vec());
        }
    }

    let mut digests = digests.into_iter();
    let mut banks = Vec::new();
    for (hash_alg, sizeof_select, select) in slots.into_iter().take(select_count as usize) {
        let Some(bitmap) = select.get(..sizeof_select as usize) else {
            bail!("invalid sizeofSelect {sizeof_select} for bank 0x{hash_alg:04x}");
        };
        let mut values = Vec::new();
        for index in selected_indices(bitmap) {
            let digest = digests.next().with_context(|| {
                format!("no value for PCR {index} of bank 0x{hash_alg:04x}")
            })?;
            values.push((index, digest));
        }
        banks.push(PcrBank { hash_alg, values });
    }
    if digests.next().is_some() {
        bail!("PCR blob holds more values than were selected");
    }
    Ok(banks)
}

fn compute_pcr_digest(banks: &[PcrBank]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for (_, value) in banks.iter().flat_map(|bank| bank.values.iter()) {
        hasher.update(value);
    }
    hasher.finalize().to_vec()
}

#[derive(Debug)]
enum PublicKey {
    Rsa(RsaPublicKey),
    Ecc(VerifyingKey),
}

/// Load an AIK given as a PEM SubjectPublicKeyInfo
fn parse_aik_pem(pem: &str) -> Result<PublicKey> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        debug!("loaded RSA AIK");
        return Ok(PublicKey::Rsa(key));
    }
    let key = VerifyingKey::from_public_key_pem(pem)
        .map_err(|e| anyhow!("AIK is neither an RSA nor a P-256 public key: {e}"))?;
    debug!("loaded ECC P-256 AIK");
    Ok(PublicKey::Ecc(key))
}

/// Check a TPMT_SIGNATURE over `message`
fn verify_signature_with_key(
    message: &[u8],
    signature: &[u8],
    public_key: &PublicKey,
) -> Result<bool> {
    fn parse_sized(input: &[u8]) -> IResult<&[u8], &[u8]> {
        let (input, size) = be_u16(input)?;
        take(size)(input)
    }

    if signature.len() < 4 {
        bail!("signature too short: {} bytes", signature.len());
    }

    let sig_alg = u16::from_be_bytes([signature[0], signature[1]]);
    let hash_alg = u16::from_be_bytes([signature[2], signature[3]]);

    if hash_alg != TPM_ALG_SHA256 {
        bail!("unsupported hash algorithm: 0x{hash_alg:04x}");
    }

    let actual_signature = &signature[4..];
    let message_hash = Sha256::digest(message);

    match public_key {
        PublicKey::Rsa(rsa_key) => {
            if sig_alg != TPM_ALG_RSASSA {
                bail!("expected RSASSA (0x0014), got 0x{sig_alg:04x}");
            }
            let (_, rsa_sig_data) = parse_sized(actual_signature)
                .map_err(|e| anyhow!("malformed RSA signature: {e}"))?;

            let padding = rsa::Pkcs1v15Sign::new::<Sha256>();
            match rsa_key.verify(padding, &message_hash, rsa_sig_data) {
                Ok(_) => {
                    debug!("RSA signature verification successful");
                    Ok(true)
                }
                Err(e) => {
                    warn!("RSA signature verification failed: {e}");
                    Ok(false)
                }
            }
        }
        PublicKey::Ecc(ecc_key) => {
            if sig_alg != TPM_ALG_ECDSA {
                bail!("expected ECDSA (0x0018), got 0x{sig_alg:04x}");
            }
            let (rest, r_data) = parse_sized(actual_signature)
                .map_err(|e| anyhow!("malformed ECDSA signatureR: {e}"))?;
            let (_, s_data) =
                parse_sized(rest).map_err(|e| anyhow!("malformed ECDSA signatureS: {e}"))?;
            if r_data.len() > 32 || s_data.len() > 32 {
                bail!(
                    "ECDSA signature too large for P-256: r={} s={}",
                    r_data.len(),
                    s_data.len()
                );
            }

            // Scalars may arrive without their leading zero bytes
            let mut sig_bytes = [0u8; 64];
            sig_bytes[32 - r_data.len()..32].copy_from_slice(r_data);
            sig_bytes[64 - s_data.len()..].copy_from_slice(s_data);

            let signature =
                Signature::from_slice(&sig_bytes).context("failed to parse ECDSA signature")?;

            match ecc_key.verify_prehash(&message_hash, &signature) {
                Ok(_) => {
                    debug!("ECC signature verification successful");
                    Ok(true)
                }
                Err(e) => {
                    warn!("ECC signature verification failed: {e}");
                    Ok(false)
                }
            }
        }
    }
}

/// Quote verification without external tooling
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeQuoteVerifier;

impl QuoteVerifier for NativeQuoteVerifier {
    fn check_quote(
        &self,
        aik_pem: &str,
        nonce: &str,
        blobs: &QuoteBlobs,
        hash_alg: HashAlg,
    ) -> Result<PcrValues> {
        let attest = parse_tpm_attest(&blobs.quote).context("failed to parse TPMS_ATTEST")?;

        let aik = parse_aik_pem(aik_pem)?;
        if !verify_signature_with_key(&blobs.quote, &blobs.signature, &aik)
            .context("signature verification error")?
        {
            bail!("signature verification failed");
        }

        if attest.qualified_data != nonce.as_bytes() {
            bail!("nonce mismatch: quote was not produced for this request");
        }

        let banks = parse_pcr_blob(&blobs.pcrs).context("failed to parse PCR blob")?;
        let provided: Vec<PcrSelection> = banks.iter().map(PcrBank::selection).collect();
        if attest.attested_quote_info.pcr_selections != provided {
            bail!(
                "PCR selection mismatch: TPMS_ATTEST has {:?}, but PCR blob has {:?}",
                attest.attested_quote_info.pcr_selections,
                provided
            );
        }
        if attest.attested_quote_info.pcr_digest != compute_pcr_digest(&banks) {
            bail!("PCR digest mismatch");
        }
        debug!("quote signature, nonce and PCR digest verified");

        Ok(banks
            .into_iter()
            .filter(|bank| bank.hash_alg == hash_alg.tpm_alg_id())
            .flat_map(|bank| bank.values)
            .map(|(index, value)| (index, hex::encode(value)))
            .collect())
    }

    fn clock_info(&self, quote_blob: &[u8]) -> Result<ClockInfo> {
        let attest = parse_tpm_attest(quote_blob).context("failed to parse TPMS_ATTEST")?;
        Ok(attest.clock_info)
    }
}
