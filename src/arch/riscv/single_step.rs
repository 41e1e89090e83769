use super::cpu_state::CpuState;
use super::is_compressed;
use crate::breakpoint::{InferiorMemory, Lifetime, Mode, SoftwareBreakpointManager};
use crate::error::Result;
use bit_field::BitField;

/// Base ISA width. RV32 changes the meaning of compressed opcode 001
/// (C.JAL there, C.ADDIW on RV64).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

/// Sign-extend `value` whose sign bit sits at bit index `sign_bit`.
fn sext(value: u64, sign_bit: u32) -> u64 {
    let shift = 63 - sign_bit;
    (((value << shift) as i64) >> shift) as u64
}

/// Successor of a full-width instruction. The dispatch masks the word down
/// to the seven-bit major opcode field before comparing.
pub fn rvi_successor(state: &CpuState, location: u64, insn: u32) -> u64 {
    match insn & 0x7f {
        // BRANCH
        0x63 => {
            let rs1 = insn.get_bits(15..20) as usize;
            let rs2 = insn.get_bits(20..25) as usize;
            let immediate = (u64::from(insn.get_bits(8..12)) << 1)
                | (u64::from(insn.get_bits(25..31)) << 5)
                | (u64::from(insn.get_bit(7)) << 11)
                | (u64::from(insn.get_bit(31)) << 12);
            let offset = sext(immediate, 12);
            let lhs = state.x(rs1);
            let rhs = state.x(rs2);
            let taken = match insn.get_bits(12..15) {
                0 => lhs == rhs,                     // BEQ
                1 => lhs != rhs,                     // BNE
                4 => (lhs as i64) < (rhs as i64),    // BLT
                5 => (lhs as i64) >= (rhs as i64),   // BGE
                6 => lhs < rhs,                      // BLTU
                7 => lhs >= rhs,                     // BGEU
                funct3 => bug!("unknown branch condition funct3={}", funct3),
            };
            if taken {
                location.wrapping_add(offset)
            } else {
                location.wrapping_add(4)
            }
        }
        // JALR
        0x67 => {
            if insn.get_bits(12..15) != 0 {
                return location.wrapping_add(4);
            }
            let rs1 = insn.get_bits(15..20) as usize;
            let immediate = sext(u64::from(insn.get_bits(20..32)), 11);
            state.x(rs1).wrapping_add(immediate)
        }
        // JAL
        0x6f => {
            let immediate = (u64::from(insn.get_bits(21..31)) << 1)
                | (u64::from(insn.get_bit(20)) << 11)
                | (u64::from(insn.get_bits(12..20)) << 12)
                | (u64::from(insn.get_bit(31)) << 20);
            location.wrapping_add(sext(immediate, 20))
        }
        _ => location.wrapping_add(4),
    }
}

/// Successor of a compressed instruction.
pub fn rvc_successor(state: &CpuState, location: u64, insn: u16, xlen: Xlen) -> u64 {
    let fallthrough = location.wrapping_add(2);
    match insn & 0x3 {
        0x1 => {
            let funct3 = insn.get_bits(13..16);
            match funct3 {
                // C.JAL is quadrant 1 opcode 001 on RV32 only.
                1 if xlen == Xlen::Rv32 => cj_target(state, location, insn),
                5 => cj_target(state, location, insn), // C.J
                6 | 7 => {
                    // C.BEQZ / C.BNEZ test a compressed register against zero.
                    let immediate = (u64::from(insn.get_bits(3..5)) << 1)
                        | (u64::from(insn.get_bits(10..12)) << 3)
                        | (u64::from(insn.get_bit(2)) << 5)
                        | (u64::from(insn.get_bits(5..7)) << 6)
                        | (u64::from(insn.get_bit(12)) << 8);
                    let rs = insn.get_bits(7..10) as usize + 8;
                    let taken = if funct3 == 6 {
                        state.x(rs) == 0
                    } else {
                        state.x(rs) != 0
                    };
                    if taken {
                        location.wrapping_add(sext(immediate, 8))
                    } else {
                        fallthrough
                    }
                }
                _ => fallthrough,
            }
        }
        0x2 => match insn.get_bits(12..16) {
            // C.JR / C.JALR, distinguished from C.MV / C.ADD by a zero
            // rs2 field.
            8 | 9 if insn.get_bits(2..7) == 0 => {
                let rs1 = insn.get_bits(7..12) as usize;
                state.x(rs1)
            }
            _ => fallthrough,
        },
        _ => fallthrough,
    }
}

fn cj_target(_state: &CpuState, location: u64, insn: u16) -> u64 {
    let immediate = (u64::from(insn.get_bits(3..6)) << 1)
        | (u64::from(insn.get_bit(11)) << 4)
        | (u64::from(insn.get_bit(2)) << 5)
        | (u64::from(insn.get_bit(7)) << 6)
        | (u64::from(insn.get_bit(6)) << 7)
        | (u64::from(insn.get_bits(9..11)) << 8)
        | (u64::from(insn.get_bit(8)) << 10)
        | (u64::from(insn.get_bit(12)) << 11);
    location.wrapping_add(sext(immediate, 11))
}

fn read_patched(
    mem: &mut dyn InferiorMemory,
    manager: &SoftwareBreakpointManager,
    address: u64,
    buf: &mut [u8],
) -> Result<()> {
    mem.read_memory(address, buf)?;
    manager.patch_read(address, buf);
    Ok(())
}

/// Where execution goes next from `location`, given the current register
/// state. Installed traps are invisible to the decode.
pub fn successor_address(
    mem: &mut dyn InferiorMemory,
    manager: &SoftwareBreakpointManager,
    state: &CpuState,
    location: u64,
    xlen: Xlen,
) -> Result<u64> {
    let mut half = [0u8; 2];
    read_patched(mem, manager, location, &mut half)?;
    let lower = u16::from_le_bytes(half);
    if is_compressed(lower) {
        Ok(rvc_successor(state, location, lower, xlen))
    } else {
        let mut word = [0u8; 4];
        read_patched(mem, manager, location, &mut word)?;
        Ok(rvi_successor(state, location, u32::from_le_bytes(word)))
    }
}

/// Software single step: decode the instruction at `address` (or pc), then
/// plant a one-shot breakpoint on its successor, sized for the encoding
/// found there. If a site already covers the successor the existing trap
/// will report the stop and nothing needs planting.
pub fn prepare_software_single_step(
    mem: &mut dyn InferiorMemory,
    manager: &mut SoftwareBreakpointManager,
    state: &CpuState,
    address: Option<u64>,
) -> Result<()> {
    let location = address.unwrap_or_else(|| state.pc());
    let destination = successor_address(mem, manager, state, location, Xlen::Rv64)?;
    if manager.has_site_at(destination) {
        return Ok(());
    }
    let size = manager.choose_size(mem, destination)?;
    manager.add(
        mem,
        destination,
        Lifetime::TemporaryOneShot,
        size,
        Mode::EXEC,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::riscv;
    use crate::breakpoint::testing::FakeMemory;

    fn state_with_pc(pc: u64) -> CpuState {
        let mut state = CpuState::default();
        state.set_pc(pc);
        state
    }

    #[test]
    fn straight_line_rvi_advances_four() {
        let state = state_with_pc(0x1000);
        // addi a0, a0, 1
        assert_eq!(rvi_successor(&state, 0x1000, 0x00150513), 0x1004);
    }

    #[test]
    fn straight_line_rvc_advances_two() {
        let state = state_with_pc(0x1000);
        // c.nop
        assert_eq!(rvc_successor(&state, 0x1000, 0x0001, Xlen::Rv64), 0x1002);
    }

    #[test]
    fn jal_forward() {
        let state = state_with_pc(0x1000);
        // jal x1, +0x20
        assert_eq!(rvi_successor(&state, 0x1000, 0x020000ef), 0x1020);
    }

    #[test]
    fn jal_backward() {
        let state = state_with_pc(0x1000);
        // jal x0, -16: imm[20]=1, imm[10:1]=0x3f8, imm[11]=1, imm[19:12]=0xff.
        let insn = (1u32 << 31) | (0x3f8 << 21) | (1 << 20) | (0xff << 12) | 0x6f;
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1000 - 16);
    }

    #[test]
    fn beq_follows_the_comparison() {
        // beq x1, x2, +8
        let insn = 0x00208463;
        let mut state = state_with_pc(0x1000);
        state.set_x(1, 7);
        state.set_x(2, 7);
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1008);
        state.set_x(2, 8);
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1004);
    }

    #[test]
    fn bne_inverts_beq() {
        // bne x1, x2, +8
        let insn = 0x00209463;
        let mut state = state_with_pc(0x1000);
        state.set_x(1, 1);
        state.set_x(2, 2);
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1008);
        state.set_x(2, 1);
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1004);
    }

    #[test]
    fn blt_is_signed_bltu_is_not() {
        // blt x1, x2, +8 / bltu x1, x2, +8
        let blt = 0x0020c463;
        let bltu = 0x0020e463;
        let mut state = state_with_pc(0x1000);
        state.set_x(1, (-1i64) as u64);
        state.set_x(2, 1);
        assert_eq!(rvi_successor(&state, 0x1000, blt), 0x1008);
        // Unsigned, -1 is the largest value.
        assert_eq!(rvi_successor(&state, 0x1000, bltu), 0x1004);
    }

    #[test]
    fn bge_and_bgeu() {
        // bge x1, x2, +8 / bgeu x1, x2, +8
        let bge = 0x0020d463;
        let bgeu = 0x0020f463;
        let mut state = state_with_pc(0x1000);
        state.set_x(1, (-1i64) as u64);
        state.set_x(2, 1);
        assert_eq!(rvi_successor(&state, 0x1000, bge), 0x1004);
        assert_eq!(rvi_successor(&state, 0x1000, bgeu), 0x1008);
    }

    #[test]
    fn branch_against_x0_reads_zero() {
        // beq x0, x0, +8 is unconditionally taken.
        let insn = 0x00000463;
        let state = state_with_pc(0x1000);
        assert_eq!(rvi_successor(&state, 0x1000, insn), 0x1008);
    }

    #[test]
    fn jalr_adds_register_and_offset() {
        // jalr x0, x5, 0x10
        let mut state = state_with_pc(0x1000);
        state.set_x(5, 0x8000);
        assert_eq!(rvi_successor(&state, 0x1000, 0x01028067), 0x8010);
        // jalr x0, x5, -4
        assert_eq!(rvi_successor(&state, 0x1000, 0xffc28067), 0x7ffc);
    }

    #[test]
    fn jalr_through_x0_lands_at_the_offset() {
        let state = state_with_pc(0x1000);
        // jalr x0, x0, 0x10: base register reads as zero.
        assert_eq!(rvi_successor(&state, 0x1000, 0x01000067), 0x10);
    }

    #[test]
    fn full_word_opcode_bits_are_masked() {
        // A JAL with every upper field populated still dispatches as JAL:
        // jal x1, +0x20 with rd/imm bits set is not equal to the bare
        // 0x0000006f word.
        let state = state_with_pc(0x1000);
        assert_ne!(0x020000ef & !0x7fu32, 0);
        assert_eq!(rvi_successor(&state, 0x1000, 0x020000ef), 0x1020);
    }

    #[test]
    fn cj_jumps_relative() {
        let state = state_with_pc(0x1000);
        // c.j +0x20
        assert_eq!(rvc_successor(&state, 0x1000, 0xa005, Xlen::Rv64), 0x1020);
        // c.j -2
        assert_eq!(rvc_successor(&state, 0x1000, 0xbffd, Xlen::Rv64), 0x0ffe);
        // c.j 0 jumps to itself.
        assert_eq!(rvc_successor(&state, 0x1000, 0xa001, Xlen::Rv64), 0x1000);
    }

    #[test]
    fn cjal_exists_only_on_rv32() {
        let state = state_with_pc(0x1000);
        // Opcode 001 quadrant 1, imm +0x20: C.JAL on RV32, C.ADDIW on RV64.
        assert_eq!(rvc_successor(&state, 0x1000, 0x2005, Xlen::Rv32), 0x1020);
        assert_eq!(rvc_successor(&state, 0x1000, 0x2005, Xlen::Rv64), 0x1002);
    }

    #[test]
    fn compressed_branches_test_against_zero() {
        let mut state = state_with_pc(0x1000);
        // c.beqz x8, +0x10 / c.bnez x8, +0x10
        state.set_x(8, 0);
        assert_eq!(rvc_successor(&state, 0x1000, 0xc801, Xlen::Rv64), 0x1010);
        assert_eq!(rvc_successor(&state, 0x1000, 0xe801, Xlen::Rv64), 0x1002);
        state.set_x(8, 5);
        assert_eq!(rvc_successor(&state, 0x1000, 0xc801, Xlen::Rv64), 0x1002);
        assert_eq!(rvc_successor(&state, 0x1000, 0xe801, Xlen::Rv64), 0x1010);
    }

    #[test]
    fn cjr_goes_through_the_register() {
        let mut state = state_with_pc(0x1000);
        state.set_x(5, 0xdead0);
        // c.jr x5 / c.jalr x5
        assert_eq!(rvc_successor(&state, 0x1000, 0x8282, Xlen::Rv64), 0xdead0);
        assert_eq!(rvc_successor(&state, 0x1000, 0x9282, Xlen::Rv64), 0xdead0);
    }

    #[test]
    fn cmv_is_not_a_jump() {
        let mut state = state_with_pc(0x1000);
        state.set_x(5, 0xdead0);
        // c.mv a0, t0 shares funct4 with c.jr but has a nonzero rs2 field.
        assert_eq!(rvc_successor(&state, 0x1000, 0x8516, Xlen::Rv64), 0x1002);
    }

    #[test]
    fn planner_plants_a_one_shot_at_the_jump_target() {
        let mut mem = FakeMemory::new();
        let mut mgr = SoftwareBreakpointManager::new();
        // jal x1, +0x20 at 0x1000; c.nop at the target.
        mem.load(0x1000, &0x020000efu32.to_le_bytes());
        mem.load(0x1020, &[0x01, 0x00]);
        let state = state_with_pc(0x1000);
        prepare_software_single_step(&mut mem, &mut mgr, &state, None).unwrap();
        assert!(mgr.has_site_at(0x1020));
        // Compressed target gets the compressed trap.
        assert_eq!(mem.raw(0x1020, 2), riscv::C_EBREAK.to_vec());
    }

    #[test]
    fn planner_follows_taken_branches() {
        let mut mem = FakeMemory::new();
        let mut mgr = SoftwareBreakpointManager::new();
        // beq x1, x2, +8 at 0x1000; RVI instructions at both successors.
        mem.load(0x1000, &0x00208463u32.to_le_bytes());
        mem.load(0x1004, &0x00150513u32.to_le_bytes());
        mem.load(0x1008, &0x00150513u32.to_le_bytes());
        let mut state = state_with_pc(0x1000);
        state.set_x(1, 3);
        state.set_x(2, 3);
        prepare_software_single_step(&mut mem, &mut mgr, &state, None).unwrap();
        assert!(mgr.has_site_at(0x1008));
        assert_eq!(mem.raw(0x1008, 4), riscv::EBREAK.to_vec());

        let mut mgr = SoftwareBreakpointManager::new();
        let mut mem2 = FakeMemory::new();
        mem2.load(0x1000, &0x00208463u32.to_le_bytes());
        mem2.load(0x1004, &0x00150513u32.to_le_bytes());
        mem2.load(0x1008, &0x00150513u32.to_le_bytes());
        state.set_x(2, 4);
        prepare_software_single_step(&mut mem2, &mut mgr, &state, None).unwrap();
        assert!(mgr.has_site_at(0x1004));
    }

    #[test]
    fn planner_handles_a_jump_to_itself() {
        let mut mem = FakeMemory::new();
        let mut mgr = SoftwareBreakpointManager::new();
        // c.j 0 at 0x1000.
        mem.load(0x1000, &[0x01, 0xa0]);
        let state = state_with_pc(0x1000);
        prepare_software_single_step(&mut mem, &mut mgr, &state, None).unwrap();
        assert!(mgr.has_site_at(0x1000));
        assert_eq!(mem.raw(0x1000, 2), riscv::C_EBREAK.to_vec());
    }

    #[test]
    fn planner_decodes_through_installed_traps() {
        let mut mem = FakeMemory::new();
        let mut mgr = SoftwareBreakpointManager::new();
        // A permanent breakpoint already sits on the jal we are stepping.
        mem.load(0x1000, &0x020000efu32.to_le_bytes());
        mem.load(0x1020, &[0x01, 0x00]);
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        let state = state_with_pc(0x1000);
        prepare_software_single_step(&mut mem, &mut mgr, &state, None).unwrap();
        // The decode saw the jal under the trap, not the trap itself.
        assert!(mgr.has_site_at(0x1020));
    }

    #[test]
    fn planner_reuses_an_existing_site_at_the_target() {
        let mut mem = FakeMemory::new();
        let mut mgr = SoftwareBreakpointManager::new();
        mem.load(0x1000, &0x020000efu32.to_le_bytes());
        mem.load(0x1020, &[0x01, 0x00]);
        mgr.add(&mut mem, 0x1020, Lifetime::Permanent, 2, Mode::EXEC)
            .unwrap();
        let state = state_with_pc(0x1000);
        prepare_software_single_step(&mut mem, &mut mgr, &state, None).unwrap();
        // Still exactly one site there, the permanent one.
        assert_eq!(mgr.site_count(), 1);
    }
}
