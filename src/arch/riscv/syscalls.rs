//! Instruction payloads injected into the inferior to run mmap/munmap on
//! its behalf. Each payload ends in an `ebreak` so the injector can wait
//! for the trap, and loads 64-bit operands pc-relative from a literal pool
//! placed right after the code.

/// Syscall numbers from the riscv64 (asm-generic) table. These are the
/// inferior's numbers, not the host's.
const NR_MMAP: u32 = 222;
const NR_MUNMAP: u32 = 215;

/// MAP_PRIVATE | MAP_ANONYMOUS in the generic layout riscv uses.
const MAP_PRIVATE_ANON: u32 = 0x22;

const XOR_A0_ZERO_ZERO: u32 = 0x0000_4533;
const AUIPC_A0_0: u32 = 0x0000_0517;
const AUIPC_A1_0: u32 = 0x0000_0597;
const ECALL: u32 = 0x0000_0073;
const EBREAK: u32 = 0x0010_0073;

/// `ld rd, offset(rd)`
fn ld(rd: u32, offset: u32) -> u32 {
    debug_assert!(offset < 0x800);
    (offset << 20) | (rd << 15) | (0b011 << 12) | (rd << 7) | 0x03
}

/// `addi rd, x0, imm` for small non-negative immediates.
fn li(rd: u32, imm: u32) -> u32 {
    debug_assert!(imm < 0x800);
    (imm << 20) | (rd << 7) | 0x13
}

fn emit(code: &mut Vec<u8>, instruction: u32) {
    code.extend_from_slice(&instruction.to_le_bytes());
}

/// mmap(0, size, protection, MAP_PRIVATE|MAP_ANON, -1, 0), result in a0.
///
/// ```text
///     xor   a0, zero, zero
///     auipc a1, 0
///     ld    a1, .Lsize
///     li    a2, protection
///     li    a3, MAP_PRIVATE|MAP_ANON
///     li    a4, -1
///     li    a5, 0
///     li    a7, __NR_mmap
///     ecall
///     ebreak
/// .Lsize:
///     .quad size
/// ```
pub fn mmap(size: u64, protection: i32, code: &mut Vec<u8>) {
    debug_assert!(protection >= 0 && protection < 0x800);
    emit(code, XOR_A0_ZERO_ZERO);
    emit(code, AUIPC_A1_0);
    // The auipc sits at offset 4; the literal pool starts at offset 40.
    emit(code, ld(11, 40 - 4));
    emit(code, li(12, protection as u32));
    emit(code, li(13, MAP_PRIVATE_ANON));
    emit(code, 0xfff0_0713); // li a4, -1
    emit(code, li(15, 0));
    emit(code, li(17, NR_MMAP));
    emit(code, ECALL);
    emit(code, EBREAK);
    code.extend_from_slice(&size.to_le_bytes());
}

/// munmap(address, size), result in a0.
///
/// ```text
///     auipc a0, 0
///     ld    a0, .Laddress
///     auipc a1, 0
///     ld    a1, .Lsize
///     li    a7, __NR_munmap
///     ecall
///     ebreak
/// .Laddress:
///     .quad address
/// .Lsize:
///     .quad size
/// ```
pub fn munmap(address: u64, size: u64, code: &mut Vec<u8>) {
    emit(code, AUIPC_A0_0);
    emit(code, ld(10, 28));
    emit(code, AUIPC_A1_0);
    emit(code, ld(11, 36 - 8));
    emit(code, li(17, NR_MUNMAP));
    emit(code, ECALL);
    emit(code, EBREAK);
    code.extend_from_slice(&address.to_le_bytes());
    code.extend_from_slice(&size.to_le_bytes());
}
