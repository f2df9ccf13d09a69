//! # Command Encoders
//!
//! Packing of logical commands into raw command-processor words.
//!
//! Each GPU generation packs packets slightly differently; the winsys picks
//! one [`CommandEncoder`] implementation at device creation time and treats
//! it as an opaque, side-effect-free word producer with statically known
//! packet lengths. Command streams only ever need three things from it:
//! engine no-op words for padding, the chain ("jump") packet, and a small
//! set of data-path packets used by tests and bring-up tools.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::driver::EngineType;
use crate::types::{GpuAddr, GpuGeneration};

// =============================================================================
// PACKET HELPERS
// =============================================================================

/// Build a type-3 packet header: opcode plus payload dword count
#[inline]
const fn pkt3(opcode: u32, count: u32) -> u32 {
    (3 << 30) | ((count - 1) << 16) | (opcode << 8)
}

const OP_NOP: u32 = 0x10;
const OP_WRITE_DATA: u32 = 0x37;
const OP_INDIRECT_BUFFER: u32 = 0x3F;
const OP_RELEASE_MEM: u32 = 0x49;

/// Type-3 no-op word used to pad graphics/compute streams
const NOP_TYPE3: u32 = 0xFFFF_1000;
/// Type-2 no-op word used to pad the video decode stream
const NOP_TYPE2: u32 = 0x8000_0000;

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Dword length of a chain packet; identical across supported generations,
/// so streams can reserve the space statically.
pub const CHAIN_LEN_DW: u32 = 4;

/// Per-generation command packing
pub trait CommandEncoder: Send + Sync {
    /// Generation this encoder packs for
    fn generation(&self) -> GpuGeneration;

    /// Engine-specific no-op word used for padding
    fn nop_word(&self, engine: EngineType) -> u32;

    /// Encode a chain packet jumping to `target` into `out`.
    ///
    /// The executed dword count of the continuation buffer is not known
    /// yet; the returned index names the dword inside `out` that
    /// [`Self::patch_chain_size`] must later rewrite.
    fn encode_chain(&self, target: GpuAddr, out: &mut [u32; CHAIN_LEN_DW as usize]) -> usize;

    /// Patch the continuation size into a chain packet's size dword,
    /// preserving its control bits.
    fn patch_chain_size(&self, slot: &mut u32, size_dw: u32);

    /// Dword length of a WRITE_DATA packet carrying `n` payload dwords
    fn write_data_len_dw(&self, n: usize) -> u32 {
        4 + n as u32
    }

    /// Encode a WRITE_DATA packet storing `data` at `dst`
    fn encode_write_data(&self, dst: GpuAddr, data: &[u32], out: &mut Vec<u32>);

    /// Dword length of a fence release packet
    fn release_mem_len_dw(&self) -> u32 {
        6
    }

    /// Encode a fence release: write `value` to `dst` once prior work
    /// retires
    fn encode_release_mem(&self, dst: GpuAddr, value: u64, out: &mut Vec<u32>);
}

/// Select the encoder for a generation
pub fn encoder_for(generation: GpuGeneration) -> Option<Arc<dyn CommandEncoder>> {
    match generation {
        GpuGeneration::Gfx9 => Some(Arc::new(Gfx9Encoder)),
        GpuGeneration::Gfx10 => Some(Arc::new(Gfx10Encoder)),
        GpuGeneration::Unknown => None,
    }
}

// =============================================================================
// GFX9
// =============================================================================

/// Gfx9 command packing
#[derive(Debug)]
pub struct Gfx9Encoder;

/// Gfx9 chain control: bit 20 marks the packet as a chained continuation
const GFX9_CHAIN: u32 = 1 << 20;
/// Size bits of the chain control dword
const CHAIN_SIZE_MASK: u32 = 0xF_FFFF;

impl CommandEncoder for Gfx9Encoder {
    fn generation(&self) -> GpuGeneration {
        GpuGeneration::Gfx9
    }

    fn nop_word(&self, engine: EngineType) -> u32 {
        match engine {
            EngineType::Graphics | EngineType::Compute => NOP_TYPE3,
            EngineType::Dma => 0x0000_0000,
            EngineType::VideoDecode => NOP_TYPE2,
        }
    }

    fn encode_chain(&self, target: GpuAddr, out: &mut [u32; CHAIN_LEN_DW as usize]) -> usize {
        out[0] = pkt3(OP_INDIRECT_BUFFER, 3);
        out[1] = target.raw() as u32;
        out[2] = (target.raw() >> 32) as u32;
        out[3] = GFX9_CHAIN;
        3
    }

    fn patch_chain_size(&self, slot: &mut u32, size_dw: u32) {
        debug_assert!(size_dw <= CHAIN_SIZE_MASK);
        *slot = (*slot & !CHAIN_SIZE_MASK) | (size_dw & CHAIN_SIZE_MASK);
    }

    fn encode_write_data(&self, dst: GpuAddr, data: &[u32], out: &mut Vec<u32>) {
        out.push(pkt3(OP_WRITE_DATA, 3 + data.len() as u32));
        // dst select: memory, write confirm
        out.push((5 << 8) | (1 << 20));
        out.push(dst.raw() as u32);
        out.push((dst.raw() >> 32) as u32);
        out.extend_from_slice(data);
    }

    fn encode_release_mem(&self, dst: GpuAddr, value: u64, out: &mut Vec<u32>) {
        out.push(pkt3(OP_RELEASE_MEM, 5));
        // event: bottom-of-pipe timestamp, cache flush
        out.push(0x0000_0504);
        out.push(dst.raw() as u32);
        out.push((dst.raw() >> 32) as u32);
        out.push(value as u32);
        out.push((value >> 32) as u32);
    }
}

// =============================================================================
// GFX10
// =============================================================================

/// Gfx10 command packing
///
/// Gfx10 keeps the Gfx9 packet layout but requires the fetcher-valid bit on
/// chained indirect buffers and a different WRITE_DATA destination select.
#[derive(Debug)]
pub struct Gfx10Encoder;

const GFX10_CHAIN: u32 = (1 << 20) | (1 << 23);

impl CommandEncoder for Gfx10Encoder {
    fn generation(&self) -> GpuGeneration {
        GpuGeneration::Gfx10
    }

    fn nop_word(&self, engine: EngineType) -> u32 {
        match engine {
            EngineType::Graphics | EngineType::Compute => NOP_TYPE3,
            EngineType::Dma => 0x0000_0000,
            EngineType::VideoDecode => NOP_TYPE2,
        }
    }

    fn encode_chain(&self, target: GpuAddr, out: &mut [u32; CHAIN_LEN_DW as usize]) -> usize {
        out[0] = pkt3(OP_INDIRECT_BUFFER, 3);
        out[1] = target.raw() as u32;
        out[2] = (target.raw() >> 32) as u32;
        out[3] = GFX10_CHAIN;
        3
    }

    fn patch_chain_size(&self, slot: &mut u32, size_dw: u32) {
        debug_assert!(size_dw <= CHAIN_SIZE_MASK);
        *slot = (*slot & !CHAIN_SIZE_MASK) | (size_dw & CHAIN_SIZE_MASK);
    }

    fn encode_write_data(&self, dst: GpuAddr, data: &[u32], out: &mut Vec<u32>) {
        out.push(pkt3(OP_WRITE_DATA, 3 + data.len() as u32));
        // dst select: TC L2, write confirm
        out.push((2 << 8) | (1 << 20));
        out.push(dst.raw() as u32);
        out.push((dst.raw() >> 32) as u32);
        out.extend_from_slice(data);
    }

    fn encode_release_mem(&self, dst: GpuAddr, value: u64, out: &mut Vec<u32>) {
        out.push(pkt3(OP_RELEASE_MEM, 5));
        out.push(0x0000_0514);
        out.push(dst.raw() as u32);
        out.push((dst.raw() >> 32) as u32);
        out.push(value as u32);
        out.push((value >> 32) as u32);
    }
}

/// A padding-only NOP packet covering `count` dwords in one packet
/// (header + payload), for encoders that prefer packet no-ops over
/// repeated single words.
pub fn nop_packet(count: u32, out: &mut Vec<u32>) {
    debug_assert!(count >= 2);
    out.push(pkt3(OP_NOP, count - 1));
    for _ in 0..count - 1 {
        out.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_packet_layout() {
        let enc = Gfx10Encoder;
        let mut out = [0u32; CHAIN_LEN_DW as usize];
        let slot = enc.encode_chain(GpuAddr::new(0x1234_5678_9000), &mut out);
        assert_eq!(slot, 3);
        assert_eq!(out[1], 0x5678_9000);
        assert_eq!(out[2], 0x1234);
        // size field starts empty
        assert_eq!(out[3] & CHAIN_SIZE_MASK, 0);
    }

    #[test]
    fn test_chain_size_patch_preserves_control() {
        let enc = Gfx9Encoder;
        let mut out = [0u32; CHAIN_LEN_DW as usize];
        let slot = enc.encode_chain(GpuAddr::new(0x1000), &mut out);
        let control = out[slot];
        enc.patch_chain_size(&mut out[slot], 0x400);
        assert_eq!(out[slot] & CHAIN_SIZE_MASK, 0x400);
        assert_eq!(out[slot] & !CHAIN_SIZE_MASK, control & !CHAIN_SIZE_MASK);
    }

    #[test]
    fn test_write_data_length() {
        let enc = Gfx10Encoder;
        let mut out = Vec::new();
        enc.encode_write_data(GpuAddr::new(0x2000), &[1, 2, 3], &mut out);
        assert_eq!(out.len() as u32, enc.write_data_len_dw(3));
    }

    #[test]
    fn test_encoder_factory() {
        assert!(encoder_for(GpuGeneration::Gfx9).is_some());
        assert!(encoder_for(GpuGeneration::Gfx10).is_some());
        assert!(encoder_for(GpuGeneration::Unknown).is_none());
    }
}
