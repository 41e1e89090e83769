use super::cpu_state::{CpuState, FP_REG_COUNT, GP_REG_COUNT};
use crate::error::{ErrorCode, Result};
use lazy_static::lazy_static;
use std::convert::TryInto;

pub const REG_PC: usize = 32;
pub const REG_F0: usize = 33;
pub const REG_FCSR: usize = 65;
pub const REG_COUNT: usize = 66;

/// One row of the `qRegisterInfo` table.
pub struct RegisterInfo {
    pub name: String,
    pub alt_name: Option<&'static str>,
    pub bitsize: usize,
    pub offset: usize,
    pub encoding: &'static str,
    pub format: &'static str,
    pub set: &'static str,
    pub dwarf: Option<u32>,
    pub generic: Option<&'static str>,
}

const GP_ABI_NAMES: [&str; GP_REG_COUNT] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

const FP_ABI_NAMES: [&str; FP_REG_COUNT] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

fn generic_role(xreg: usize) -> Option<&'static str> {
    match xreg {
        1 => Some("ra"),
        2 => Some("sp"),
        8 => Some("fp"),
        10 => Some("arg1"),
        11 => Some("arg2"),
        12 => Some("arg3"),
        13 => Some("arg4"),
        14 => Some("arg5"),
        15 => Some("arg6"),
        16 => Some("arg7"),
        17 => Some("arg8"),
        _ => None,
    }
}

lazy_static! {
    pub static ref REGISTERS: Vec<RegisterInfo> = {
        let mut table = Vec::with_capacity(REG_COUNT);
        for i in 0..GP_REG_COUNT {
            table.push(RegisterInfo {
                name: format!("x{}", i),
                alt_name: Some(GP_ABI_NAMES[i]),
                bitsize: 64,
                offset: i * 8,
                encoding: "uint",
                format: "hex",
                set: "General Purpose Registers",
                dwarf: Some(i as u32),
                generic: generic_role(i),
            });
        }
        table.push(RegisterInfo {
            name: "pc".to_owned(),
            alt_name: None,
            bitsize: 64,
            offset: GP_REG_COUNT * 8,
            encoding: "uint",
            format: "hex",
            set: "General Purpose Registers",
            dwarf: None,
            generic: Some("pc"),
        });
        for i in 0..FP_REG_COUNT {
            table.push(RegisterInfo {
                name: format!("f{}", i),
                alt_name: Some(FP_ABI_NAMES[i]),
                bitsize: 64,
                offset: (GP_REG_COUNT + 1) * 8 + i * 8,
                encoding: "ieee754",
                format: "float",
                set: "Floating Point Registers",
                dwarf: Some(32 + i as u32),
                generic: None,
            });
        }
        table.push(RegisterInfo {
            name: "fcsr".to_owned(),
            alt_name: None,
            bitsize: 32,
            offset: (GP_REG_COUNT + 1 + FP_REG_COUNT) * 8,
            encoding: "uint",
            format: "hex",
            set: "Floating Point Registers",
            dwarf: None,
            generic: None,
        });
        table
    };
}

/// Read one register by protocol number. Returns (value, byte width).
pub fn read_register(state: &CpuState, regno: usize) -> Result<(u64, usize)> {
    match regno {
        0..=31 => Ok((state.x(regno), 8)),
        REG_PC => Ok((state.pc(), 8)),
        REG_F0..=64 => Ok((state.f_dbl(regno - REG_F0), 8)),
        REG_FCSR => Ok((u64::from(state.fp.fcsr), 4)),
        _ => Err(ErrorCode::InvalidArgument),
    }
}

pub fn write_register(state: &mut CpuState, regno: usize, value: u64) -> Result<()> {
    match regno {
        0..=31 => state.set_x(regno, value),
        REG_PC => state.set_pc(value),
        REG_F0..=64 => state.set_f_dbl(regno - REG_F0, value),
        REG_FCSR => state.fp.fcsr = value as u32,
        _ => return Err(ErrorCode::InvalidArgument),
    }
    Ok(())
}

/// Serialize the full register file in `g` packet order: x0..x31 (x0 sent
/// as zero), pc, f0..f31, fcsr — all little-endian.
pub fn g_packet_bytes(state: &CpuState) -> Vec<u8> {
    let mut out = Vec::with_capacity((GP_REG_COUNT + 1 + FP_REG_COUNT) * 8 + 4);
    out.extend_from_slice(&0u64.to_le_bytes());
    for i in 1..GP_REG_COUNT {
        out.extend_from_slice(&state.gp.regs[i].to_le_bytes());
    }
    out.extend_from_slice(&state.pc().to_le_bytes());
    for i in 0..FP_REG_COUNT {
        out.extend_from_slice(&state.f_dbl(i).to_le_bytes());
    }
    out.extend_from_slice(&state.fp.fcsr.to_le_bytes());
    out
}

/// Apply a `G` packet body. Short writes update a prefix of the file, which
/// is how debuggers send integer-only register sets.
pub fn set_from_g_packet(state: &mut CpuState, bytes: &[u8]) -> Result<()> {
    if bytes.len() % 4 != 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    let mut words = bytes.chunks_exact(8);
    let mut index = 0;
    for chunk in &mut words {
        let value = u64::from_le_bytes(chunk.try_into().unwrap());
        match index {
            0 => {}
            1..=31 => state.gp.regs[index] = value,
            32 => state.set_pc(value),
            33..=64 => state.set_f_dbl(index - 33, value),
            _ => return Err(ErrorCode::InvalidArgument),
        }
        index += 1;
    }
    let tail = words.remainder();
    if tail.len() == 4 && index == 65 {
        state.fp.fcsr = u32::from_le_bytes(tail.try_into().unwrap());
    } else if !tail.is_empty() {
        return Err(ErrorCode::InvalidArgument);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        assert_eq!(REGISTERS.len(), REG_COUNT);
        assert_eq!(REGISTERS[0].name, "x0");
        assert_eq!(REGISTERS[0].alt_name, Some("zero"));
        assert_eq!(REGISTERS[REG_PC].name, "pc");
        assert_eq!(REGISTERS[REG_PC].generic, Some("pc"));
        assert_eq!(REGISTERS[REG_FCSR].name, "fcsr");
        assert_eq!(REGISTERS[2].generic, Some("sp"));
    }

    #[test]
    fn g_packet_round_trip() {
        let mut state = CpuState::default();
        state.set_pc(0x0000_0000_8000_1234);
        state.set_x(1, 0x1111);
        state.set_x(31, 0x3131);
        state.set_f_dbl(0, 0xf0f0);
        state.fp.fcsr = 0xa1;

        let bytes = g_packet_bytes(&state);
        assert_eq!(bytes.len(), 66 * 8 - 4);

        let mut decoded = CpuState::default();
        set_from_g_packet(&mut decoded, &bytes).unwrap();
        assert_eq!(decoded.pc(), state.pc());
        assert_eq!(decoded.x(1), 0x1111);
        assert_eq!(decoded.x(31), 0x3131);
        assert_eq!(decoded.f_dbl(0), 0xf0f0);
        assert_eq!(decoded.fp.fcsr, 0xa1);
    }

    #[test]
    fn x0_slot_in_g_packet_is_zero() {
        let mut state = CpuState::default();
        state.set_pc(0xdeadbeef);
        let bytes = g_packet_bytes(&state);
        assert_eq!(&bytes[..8], &[0u8; 8]);
        // pc travels in its own slot at offset 256, not in x0's.
        assert_eq!(bytes[256..264], 0xdeadbeefu64.to_le_bytes());
    }

    #[test]
    fn single_register_access() {
        let mut state = CpuState::default();
        write_register(&mut state, 2, 0x7ffe_0000).unwrap();
        assert_eq!(read_register(&state, 2).unwrap(), (0x7ffe_0000, 8));
        write_register(&mut state, REG_PC, 0x4000).unwrap();
        assert_eq!(read_register(&state, REG_PC).unwrap(), (0x4000, 8));
        write_register(&mut state, REG_FCSR, 0x3).unwrap();
        assert_eq!(read_register(&state, REG_FCSR).unwrap(), (3, 4));
        assert!(read_register(&state, 200).is_err());
    }
}
