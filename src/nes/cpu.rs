pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

const STACK_BASE: u16 = 0x0100;
const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

/// Memory seen by the CPU.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    /// Side-effect free read used by the disassembler.
    fn peek(&self, addr: u16) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Imp,
    Imm,
    Zp0,
    Zpx,
    Zpy,
    Rel,
    Abs,
    Abx,
    Aby,
    Ind,
    Izx,
    Izy,
}

impl Mode {
    /// Operand bytes following the opcode.
    pub fn operand_len(self) -> u16 {
        match self {
            Mode::Imp => 0,
            Mode::Imm | Mode::Zp0 | Mode::Zpx | Mode::Zpy | Mode::Rel | Mode::Izx | Mode::Izy => 1,
            Mode::Abs | Mode::Abx | Mode::Aby | Mode::Ind => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    /// Undefined opcode; consumes its cycles and does nothing else.
    Xxx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub name: &'static str,
    pub op: Op,
    pub mode: Mode,
    pub cycles: u8,
}

const fn ins(name: &'static str, op: Op, mode: Mode, cycles: u8) -> Instruction {
    Instruction {
        name,
        op,
        mode,
        cycles,
    }
}

pub static INSTRUCTIONS: [Instruction; 256] = {
    use Mode::*;
    use Op::*;
    [
        ins("BRK", Brk, Imm, 7), ins("ORA", Ora, Izx, 6), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zp0, 3), ins("ORA", Ora, Zp0, 3), ins("ASL", Asl, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("PHP", Php, Imp, 3), ins("ORA", Ora, Imm, 2), ins("ASL", Asl, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("NOP", Nop, Abs, 4), ins("ORA", Ora, Abs, 4), ins("ASL", Asl, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BPL", Bpl, Rel, 2), ins("ORA", Ora, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("ORA", Ora, Zpx, 4), ins("ASL", Asl, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("CLC", Clc, Imp, 2), ins("ORA", Ora, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("ORA", Ora, Abx, 4), ins("ASL", Asl, Abx, 7), ins("???", Xxx, Imp, 7),
        ins("JSR", Jsr, Abs, 6), ins("AND", And, Izx, 6), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("BIT", Bit, Zp0, 3), ins("AND", And, Zp0, 3), ins("ROL", Rol, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("PLP", Plp, Imp, 4), ins("AND", And, Imm, 2), ins("ROL", Rol, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("BIT", Bit, Abs, 4), ins("AND", And, Abs, 4), ins("ROL", Rol, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BMI", Bmi, Rel, 2), ins("AND", And, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("AND", And, Zpx, 4), ins("ROL", Rol, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("SEC", Sec, Imp, 2), ins("AND", And, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("AND", And, Abx, 4), ins("ROL", Rol, Abx, 7), ins("???", Xxx, Imp, 7),
        ins("RTI", Rti, Imp, 6), ins("EOR", Eor, Izx, 6), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zp0, 3), ins("EOR", Eor, Zp0, 3), ins("LSR", Lsr, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("PHA", Pha, Imp, 3), ins("EOR", Eor, Imm, 2), ins("LSR", Lsr, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("JMP", Jmp, Abs, 3), ins("EOR", Eor, Abs, 4), ins("LSR", Lsr, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BVC", Bvc, Rel, 2), ins("EOR", Eor, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("EOR", Eor, Zpx, 4), ins("LSR", Lsr, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("CLI", Cli, Imp, 2), ins("EOR", Eor, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("EOR", Eor, Abx, 4), ins("LSR", Lsr, Abx, 7), ins("???", Xxx, Imp, 7),
        ins("RTS", Rts, Imp, 6), ins("ADC", Adc, Izx, 6), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zp0, 3), ins("ADC", Adc, Zp0, 3), ins("ROR", Ror, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("PLA", Pla, Imp, 4), ins("ADC", Adc, Imm, 2), ins("ROR", Ror, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("JMP", Jmp, Ind, 5), ins("ADC", Adc, Abs, 4), ins("ROR", Ror, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BVS", Bvs, Rel, 2), ins("ADC", Adc, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("ADC", Adc, Zpx, 4), ins("ROR", Ror, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("SEI", Sei, Imp, 2), ins("ADC", Adc, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("ADC", Adc, Abx, 4), ins("ROR", Ror, Abx, 7), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Imm, 2), ins("STA", Sta, Izx, 6), ins("NOP", Nop, Imm, 2), ins("???", Xxx, Imp, 6),
        ins("STY", Sty, Zp0, 3), ins("STA", Sta, Zp0, 3), ins("STX", Stx, Zp0, 3), ins("???", Xxx, Imp, 3),
        ins("DEY", Dey, Imp, 2), ins("NOP", Nop, Imm, 2), ins("TXA", Txa, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("STY", Sty, Abs, 4), ins("STA", Sta, Abs, 4), ins("STX", Stx, Abs, 4), ins("???", Xxx, Imp, 4),
        ins("BCC", Bcc, Rel, 2), ins("STA", Sta, Izy, 6), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 6),
        ins("STY", Sty, Zpx, 4), ins("STA", Sta, Zpx, 4), ins("STX", Stx, Zpy, 4), ins("???", Xxx, Imp, 4),
        ins("TYA", Tya, Imp, 2), ins("STA", Sta, Aby, 5), ins("TXS", Txs, Imp, 2), ins("???", Xxx, Imp, 5),
        ins("NOP", Nop, Abx, 5), ins("STA", Sta, Abx, 5), ins("???", Xxx, Imp, 5), ins("???", Xxx, Imp, 5),
        ins("LDY", Ldy, Imm, 2), ins("LDA", Lda, Izx, 6), ins("LDX", Ldx, Imm, 2), ins("???", Xxx, Imp, 6),
        ins("LDY", Ldy, Zp0, 3), ins("LDA", Lda, Zp0, 3), ins("LDX", Ldx, Zp0, 3), ins("???", Xxx, Imp, 3),
        ins("TAY", Tay, Imp, 2), ins("LDA", Lda, Imm, 2), ins("TAX", Tax, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("LDY", Ldy, Abs, 4), ins("LDA", Lda, Abs, 4), ins("LDX", Ldx, Abs, 4), ins("???", Xxx, Imp, 4),
        ins("BCS", Bcs, Rel, 2), ins("LDA", Lda, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 5),
        ins("LDY", Ldy, Zpx, 4), ins("LDA", Lda, Zpx, 4), ins("LDX", Ldx, Zpy, 4), ins("???", Xxx, Imp, 4),
        ins("CLV", Clv, Imp, 2), ins("LDA", Lda, Aby, 4), ins("TSX", Tsx, Imp, 2), ins("???", Xxx, Imp, 4),
        ins("LDY", Ldy, Abx, 4), ins("LDA", Lda, Abx, 4), ins("LDX", Ldx, Aby, 4), ins("???", Xxx, Imp, 4),
        ins("CPY", Cpy, Imm, 2), ins("CMP", Cmp, Izx, 6), ins("NOP", Nop, Imm, 2), ins("???", Xxx, Imp, 8),
        ins("CPY", Cpy, Zp0, 3), ins("CMP", Cmp, Zp0, 3), ins("DEC", Dec, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("INY", Iny, Imp, 2), ins("CMP", Cmp, Imm, 2), ins("DEX", Dex, Imp, 2), ins("???", Xxx, Imp, 2),
        ins("CPY", Cpy, Abs, 4), ins("CMP", Cmp, Abs, 4), ins("DEC", Dec, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BNE", Bne, Rel, 2), ins("CMP", Cmp, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("CMP", Cmp, Zpx, 4), ins("DEC", Dec, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("CLD", Cld, Imp, 2), ins("CMP", Cmp, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("CMP", Cmp, Abx, 4), ins("DEC", Dec, Abx, 7), ins("???", Xxx, Imp, 7),
        ins("CPX", Cpx, Imm, 2), ins("SBC", Sbc, Izx, 6), ins("NOP", Nop, Imm, 2), ins("???", Xxx, Imp, 8),
        ins("CPX", Cpx, Zp0, 3), ins("SBC", Sbc, Zp0, 3), ins("INC", Inc, Zp0, 5), ins("???", Xxx, Imp, 5),
        ins("INX", Inx, Imp, 2), ins("SBC", Sbc, Imm, 2), ins("NOP", Nop, Imp, 2), ins("SBC", Sbc, Imm, 2),
        ins("CPX", Cpx, Abs, 4), ins("SBC", Sbc, Abs, 4), ins("INC", Inc, Abs, 6), ins("???", Xxx, Imp, 6),
        ins("BEQ", Beq, Rel, 2), ins("SBC", Sbc, Izy, 5), ins("???", Xxx, Imp, 2), ins("???", Xxx, Imp, 8),
        ins("NOP", Nop, Zpx, 4), ins("SBC", Sbc, Zpx, 4), ins("INC", Inc, Zpx, 6), ins("???", Xxx, Imp, 6),
        ins("SED", Sed, Imp, 2), ins("SBC", Sbc, Aby, 4), ins("NOP", Nop, Imp, 2), ins("???", Xxx, Imp, 7),
        ins("NOP", Nop, Abx, 4), ins("SBC", Sbc, Abx, 4), ins("INC", Inc, Abx, 7), ins("???", Xxx, Imp, 7),
    ]
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,
}

pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,

    cycles: u8,
    fetched: u8,
    addr_abs: u16,
    addr_rel: u16,
    opcode: u8,
    total_cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
            status: FLAG_UNUSED,
            cycles: 0,
            fetched: 0,
            addr_abs: 0,
            addr_rel: 0,
            opcode: 0,
            total_cycles: 0,
        }
    }

    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.pc = read_u16(bus, RESET_VECTOR);
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0xFD;
        self.status = FLAG_UNUSED;

        self.addr_abs = 0;
        self.addr_rel = 0;
        self.fetched = 0;
        self.opcode = 0;
        self.total_cycles = 0;

        self.cycles = 8;
    }

    /// Maskable interrupt; ignored while I is set.
    pub fn irq<B: CpuBus>(&mut self, bus: &mut B) {
        if self.get_flag(FLAG_INTERRUPT) {
            return;
        }
        self.interrupt(bus, IRQ_VECTOR);
        self.cycles = 7;
    }

    pub fn nmi<B: CpuBus>(&mut self, bus: &mut B) {
        self.interrupt(bus, NMI_VECTOR);
        self.cycles = 8;
    }

    fn interrupt<B: CpuBus>(&mut self, bus: &mut B, vector: u16) {
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, self.pc as u8);

        self.set_flag(FLAG_BREAK, false);
        self.set_flag(FLAG_UNUSED, true);
        self.set_flag(FLAG_INTERRUPT, true);
        self.push(bus, self.status);

        self.pc = read_u16(bus, vector);
    }

    /// Advances one CPU cycle. A whole instruction executes on the cycle it
    /// is fetched; the remaining cycles only burn time.
    pub fn clock<B: CpuBus>(&mut self, bus: &mut B) {
        if self.cycles == 0 {
            self.opcode = bus.read(self.pc);
            self.set_flag(FLAG_UNUSED, true);
            self.pc = self.pc.wrapping_add(1);

            let instruction = INSTRUCTIONS[self.opcode as usize];
            self.cycles = instruction.cycles;

            let extra_from_mode = self.address(bus, instruction.mode);
            let extra_from_op = self.execute(bus, instruction.op, instruction.mode);
            if extra_from_mode && extra_from_op {
                self.cycles += 1;
            }

            self.set_flag(FLAG_UNUSED, true);
        }

        self.cycles -= 1;
        self.total_cycles += 1;
    }

    pub fn is_instruction_complete(&self) -> bool {
        self.cycles == 0
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn registers(&self) -> CpuRegisters {
        CpuRegisters {
            a: self.a,
            x: self.x,
            y: self.y,
            sp: self.sp,
            pc: self.pc,
            status: self.status,
        }
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        bus.write(STACK_BASE + self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pull<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(STACK_BASE + self.sp as u16)
    }

    fn next_byte<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn next_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.next_byte(bus) as u16;
        let hi = self.next_byte(bus) as u16;
        (hi << 8) | lo
    }

    /// Resolves the operand address. Returns true when an indexed access
    /// crossed a page, which costs a cycle for read instructions.
    fn address<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) -> bool {
        match mode {
            Mode::Imp => {
                self.fetched = self.a;
                false
            }
            Mode::Imm => {
                self.addr_abs = self.pc;
                self.pc = self.pc.wrapping_add(1);
                false
            }
            Mode::Zp0 => {
                self.addr_abs = self.next_byte(bus) as u16;
                false
            }
            Mode::Zpx => {
                self.addr_abs = self.next_byte(bus).wrapping_add(self.x) as u16;
                false
            }
            Mode::Zpy => {
                self.addr_abs = self.next_byte(bus).wrapping_add(self.y) as u16;
                false
            }
            Mode::Rel => {
                self.addr_rel = self.next_byte(bus) as i8 as i16 as u16;
                false
            }
            Mode::Abs => {
                self.addr_abs = self.next_word(bus);
                false
            }
            Mode::Abx => {
                let base = self.next_word(bus);
                self.addr_abs = base.wrapping_add(self.x as u16);
                (self.addr_abs & 0xFF00) != (base & 0xFF00)
            }
            Mode::Aby => {
                let base = self.next_word(bus);
                self.addr_abs = base.wrapping_add(self.y as u16);
                (self.addr_abs & 0xFF00) != (base & 0xFF00)
            }
            Mode::Ind => {
                let ptr = self.next_word(bus);
                // The high byte never carries into the next page.
                let hi_addr = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                let lo = bus.read(ptr) as u16;
                let hi = bus.read(hi_addr) as u16;
                self.addr_abs = (hi << 8) | lo;
                false
            }
            Mode::Izx => {
                let ptr = self.next_byte(bus).wrapping_add(self.x);
                let lo = bus.read(ptr as u16) as u16;
                let hi = bus.read(ptr.wrapping_add(1) as u16) as u16;
                self.addr_abs = (hi << 8) | lo;
                false
            }
            Mode::Izy => {
                let ptr = self.next_byte(bus);
                let lo = bus.read(ptr as u16) as u16;
                let hi = bus.read(ptr.wrapping_add(1) as u16) as u16;
                let base = (hi << 8) | lo;
                self.addr_abs = base.wrapping_add(self.y as u16);
                (self.addr_abs & 0xFF00) != (base & 0xFF00)
            }
        }
    }

    fn fetch<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) -> u8 {
        if mode != Mode::Imp {
            self.fetched = bus.read(self.addr_abs);
        }
        self.fetched
    }

    /// Writes a read-modify-write result to A or memory depending on the mode.
    fn store_result<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, value: u8) {
        if mode == Mode::Imp {
            self.a = value;
        } else {
            bus.write(self.addr_abs, value);
        }
    }

    fn branch(&mut self, condition: bool) {
        if condition {
            self.cycles += 1;
            self.addr_abs = self.pc.wrapping_add(self.addr_rel);
            if (self.addr_abs & 0xFF00) != (self.pc & 0xFF00) {
                self.cycles += 1;
            }
            self.pc = self.addr_abs;
        }
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, (!(self.a ^ value) & (self.a ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    /// Runs the operation. Returns true when the operation pays the
    /// page-cross penalty of its addressing mode.
    fn execute<B: CpuBus>(&mut self, bus: &mut B, op: Op, mode: Mode) -> bool {
        match op {
            Op::Adc => {
                let value = self.fetch(bus, mode);
                self.adc(value);
                true
            }
            Op::Sbc => {
                let value = self.fetch(bus, mode);
                self.adc(value ^ 0xFF);
                true
            }
            Op::And => {
                self.a &= self.fetch(bus, mode);
                self.update_zn(self.a);
                true
            }
            Op::Ora => {
                self.a |= self.fetch(bus, mode);
                self.update_zn(self.a);
                true
            }
            Op::Eor => {
                self.a ^= self.fetch(bus, mode);
                self.update_zn(self.a);
                true
            }
            Op::Asl => {
                let value = self.fetch(bus, mode);
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                let result = value << 1;
                self.update_zn(result);
                self.store_result(bus, mode, result);
                false
            }
            Op::Lsr => {
                let value = self.fetch(bus, mode);
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                let result = value >> 1;
                self.update_zn(result);
                self.store_result(bus, mode, result);
                false
            }
            Op::Rol => {
                let value = self.fetch(bus, mode);
                let result = (value << 1) | self.get_flag(FLAG_CARRY) as u8;
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                self.update_zn(result);
                self.store_result(bus, mode, result);
                false
            }
            Op::Ror => {
                let value = self.fetch(bus, mode);
                let result = (value >> 1) | ((self.get_flag(FLAG_CARRY) as u8) << 7);
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                self.update_zn(result);
                self.store_result(bus, mode, result);
                false
            }
            Op::Bcc => {
                self.branch(!self.get_flag(FLAG_CARRY));
                false
            }
            Op::Bcs => {
                self.branch(self.get_flag(FLAG_CARRY));
                false
            }
            Op::Beq => {
                self.branch(self.get_flag(FLAG_ZERO));
                false
            }
            Op::Bne => {
                self.branch(!self.get_flag(FLAG_ZERO));
                false
            }
            Op::Bmi => {
                self.branch(self.get_flag(FLAG_NEGATIVE));
                false
            }
            Op::Bpl => {
                self.branch(!self.get_flag(FLAG_NEGATIVE));
                false
            }
            Op::Bvc => {
                self.branch(!self.get_flag(FLAG_OVERFLOW));
                false
            }
            Op::Bvs => {
                self.branch(self.get_flag(FLAG_OVERFLOW));
                false
            }
            Op::Bit => {
                let value = self.fetch(bus, mode);
                self.set_flag(FLAG_ZERO, (self.a & value) == 0);
                self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
                self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
                false
            }
            Op::Brk => {
                // Imm addressing already stepped over the padding byte.
                self.set_flag(FLAG_INTERRUPT, true);
                self.push(bus, (self.pc >> 8) as u8);
                self.push(bus, self.pc as u8);

                self.set_flag(FLAG_BREAK, true);
                self.push(bus, self.status);
                self.set_flag(FLAG_BREAK, false);

                self.pc = read_u16(bus, IRQ_VECTOR);
                false
            }
            Op::Clc => {
                self.set_flag(FLAG_CARRY, false);
                false
            }
            Op::Cld => {
                self.set_flag(FLAG_DECIMAL, false);
                false
            }
            Op::Cli => {
                self.set_flag(FLAG_INTERRUPT, false);
                false
            }
            Op::Clv => {
                self.set_flag(FLAG_OVERFLOW, false);
                false
            }
            Op::Sec => {
                self.set_flag(FLAG_CARRY, true);
                false
            }
            Op::Sed => {
                self.set_flag(FLAG_DECIMAL, true);
                false
            }
            Op::Sei => {
                self.set_flag(FLAG_INTERRUPT, true);
                false
            }
            Op::Cmp => {
                let value = self.fetch(bus, mode);
                self.compare(self.a, value);
                true
            }
            Op::Cpx => {
                let value = self.fetch(bus, mode);
                self.compare(self.x, value);
                false
            }
            Op::Cpy => {
                let value = self.fetch(bus, mode);
                self.compare(self.y, value);
                false
            }
            Op::Dec => {
                let value = self.fetch(bus, mode).wrapping_sub(1);
                bus.write(self.addr_abs, value);
                self.update_zn(value);
                false
            }
            Op::Inc => {
                let value = self.fetch(bus, mode).wrapping_add(1);
                bus.write(self.addr_abs, value);
                self.update_zn(value);
                false
            }
            Op::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
                false
            }
            Op::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
                false
            }
            Op::Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
                false
            }
            Op::Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
                false
            }
            Op::Jmp => {
                self.pc = self.addr_abs;
                false
            }
            Op::Jsr => {
                let ret = self.pc.wrapping_sub(1);
                self.push(bus, (ret >> 8) as u8);
                self.push(bus, ret as u8);
                self.pc = self.addr_abs;
                false
            }
            Op::Rts => {
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.pc = ((hi << 8) | lo).wrapping_add(1);
                false
            }
            Op::Rti => {
                self.status = self.pull(bus);
                self.status &= !FLAG_BREAK;
                self.status &= !FLAG_UNUSED;
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.pc = (hi << 8) | lo;
                false
            }
            Op::Lda => {
                self.a = self.fetch(bus, mode);
                self.update_zn(self.a);
                true
            }
            Op::Ldx => {
                self.x = self.fetch(bus, mode);
                self.update_zn(self.x);
                true
            }
            Op::Ldy => {
                self.y = self.fetch(bus, mode);
                self.update_zn(self.y);
                true
            }
            Op::Sta => {
                bus.write(self.addr_abs, self.a);
                false
            }
            Op::Stx => {
                bus.write(self.addr_abs, self.x);
                false
            }
            Op::Sty => {
                bus.write(self.addr_abs, self.y);
                false
            }
            Op::Pha => {
                self.push(bus, self.a);
                false
            }
            Op::Php => {
                self.push(bus, self.status | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_BREAK, false);
                self.set_flag(FLAG_UNUSED, false);
                false
            }
            Op::Pla => {
                self.a = self.pull(bus);
                self.update_zn(self.a);
                false
            }
            Op::Plp => {
                self.status = self.pull(bus);
                self.set_flag(FLAG_UNUSED, true);
                false
            }
            Op::Tax => {
                self.x = self.a;
                self.update_zn(self.x);
                false
            }
            Op::Tay => {
                self.y = self.a;
                self.update_zn(self.y);
                false
            }
            Op::Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
                false
            }
            Op::Txa => {
                self.a = self.x;
                self.update_zn(self.a);
                false
            }
            Op::Txs => {
                self.sp = self.x;
                false
            }
            Op::Tya => {
                self.a = self.y;
                self.update_zn(self.a);
                false
            }
            Op::Nop => {
                // Operand forms still perform their bus read.
                if mode != Mode::Imp {
                    self.fetch(bus, mode);
                }
                matches!(self.opcode, 0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC)
            }
            Op::Xxx => false,
        }
    }
}

fn read_u16<B: CpuBus>(bus: &mut B, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi = bus.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

/// Formats the instruction at `addr`. Returns the text and the address of the
/// following instruction.
pub fn disassemble<B: CpuBus + ?Sized>(bus: &B, addr: u16) -> (String, u16) {
    let opcode = bus.peek(addr);
    let instruction = INSTRUCTIONS[opcode as usize];
    let b1 = bus.peek(addr.wrapping_add(1));
    let b2 = bus.peek(addr.wrapping_add(2));
    let word = ((b2 as u16) << 8) | b1 as u16;
    let next = addr
        .wrapping_add(1)
        .wrapping_add(instruction.mode.operand_len());

    let operand = match instruction.mode {
        Mode::Imp => String::new(),
        Mode::Imm => format!(" #${b1:02X}"),
        Mode::Zp0 => format!(" ${b1:02X}"),
        Mode::Zpx => format!(" ${b1:02X},X"),
        Mode::Zpy => format!(" ${b1:02X},Y"),
        Mode::Rel => {
            let target = next.wrapping_add(b1 as i8 as i16 as u16);
            format!(" ${target:04X}")
        }
        Mode::Abs => format!(" ${word:04X}"),
        Mode::Abx => format!(" ${word:04X},X"),
        Mode::Aby => format!(" ${word:04X},Y"),
        Mode::Ind => format!(" (${word:04X})"),
        Mode::Izx => format!(" (${b1:02X},X)"),
        Mode::Izy => format!(" (${b1:02X}),Y"),
    };

    (format!("{}{}", instruction.name, operand), next)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
    }

    impl FlatBus {
        fn with_program(origin: u16, program: &[u8]) -> Self {
            let mut mem = vec![0u8; 0x10000];
            mem[origin as usize..origin as usize + program.len()].copy_from_slice(program);
            mem[RESET_VECTOR as usize] = origin as u8;
            mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            Self { mem }
        }
    }

    impl CpuBus for FlatBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }

        fn peek(&self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
    }

    /// Clocks until the current instruction (or reset/interrupt sequence)
    /// finishes and returns the cycles spent.
    fn step(cpu: &mut Cpu, bus: &mut FlatBus) -> u32 {
        let mut cycles = 0;
        loop {
            cpu.clock(bus);
            cycles += 1;
            if cpu.is_instruction_complete() {
                return cycles;
            }
        }
    }

    fn boot(origin: u16, program: &[u8]) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::with_program(origin, program);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 8);
        (cpu, bus)
    }

    #[test]
    fn reset_loads_vector_and_clears_registers() {
        let mut bus = FlatBus::with_program(0x1234, &[0xEA]);
        let mut cpu = Cpu::new();
        cpu.a = 0x11;
        cpu.x = 0x22;
        cpu.status = 0xFF;
        cpu.reset(&mut bus);

        assert_eq!(
            cpu.registers(),
            CpuRegisters {
                a: 0,
                x: 0,
                y: 0,
                sp: 0xFD,
                pc: 0x1234,
                status: FLAG_UNUSED,
            }
        );
        assert!(!cpu.is_instruction_complete());
    }

    #[test]
    fn adc_wraps_to_zero_with_carry() {
        // LDA #$FF; ADC #$01
        let (mut cpu, mut bus) = boot(0x8000, &[0xA9, 0xFF, 0x69, 0x01]);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 2);

        assert_eq!(cpu.a, 0x00);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_ZERO));
        assert!(!cpu.get_flag(FLAG_OVERFLOW));
        assert!(!cpu.get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn adc_and_sbc_set_signed_overflow() {
        // LDA #$50; ADC #$50; SEC; SBC #$B0
        let (mut cpu, mut bus) = boot(0x8000, &[0xA9, 0x50, 0x69, 0x50, 0x38, 0xE9, 0xB0]);
        step(&mut cpu, &mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_NEGATIVE));

        step(&mut cpu, &mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.a, 0xF0);
        assert!(!cpu.get_flag(FLAG_CARRY));
        assert!(!cpu.get_flag(FLAG_OVERFLOW));
    }

    #[test]
    fn branch_timing_depends_on_page() {
        // SEC; BCC +2 (not taken); CLC; BCC +2 (taken, same page)
        let (mut cpu, mut bus) = boot(0x8000, &[0x38, 0x90, 0x02, 0x18, 0x90, 0x02]);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 2);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 3);
        assert_eq!(cpu.pc, 0x8008);

        // CLC; BCC +$20 from $80F3 lands on $8113.
        let (mut cpu, mut bus) = boot(0x80F0, &[0x18, 0x90, 0x20]);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 4);
        assert_eq!(cpu.pc, 0x8113);
    }

    #[test]
    fn indexed_read_pays_page_cross_penalty() {
        // LDX #$01; LDA $80FF,X; STA $80FF,X
        let (mut cpu, mut bus) = boot(0x8000, &[0xA2, 0x01, 0xBD, 0xFF, 0x80, 0x9D, 0xFF, 0x80]);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 5);
        assert_eq!(step(&mut cpu, &mut bus), 5);
    }

    #[test]
    fn jmp_indirect_wraps_within_page() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x6C, 0xFF, 0x10]);
        bus.mem[0x10FF] = 0x34;
        bus.mem[0x1000] = 0x12;
        bus.mem[0x1100] = 0x56;
        assert_eq!(step(&mut cpu, &mut bus), 5);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        // SEI; CLI
        let (mut cpu, mut bus) = boot(0x8000, &[0x78, 0x58]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0x90;

        step(&mut cpu, &mut bus);
        cpu.irq(&mut bus);
        assert!(cpu.is_instruction_complete());
        assert_eq!(cpu.pc, 0x8001);

        step(&mut cpu, &mut bus);
        cpu.irq(&mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert!(cpu.get_flag(FLAG_INTERRUPT));
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(bus.mem[0x01FB] & (FLAG_BREAK | FLAG_UNUSED), FLAG_UNUSED);
    }

    #[test]
    fn nmi_pushes_state_and_takes_eight_cycles() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xEA]);
        bus.mem[0xFFFA] = 0x00;
        bus.mem[0xFFFB] = 0xC0;
        cpu.set_flag(FLAG_INTERRUPT, true);

        cpu.nmi(&mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 8);
        assert_eq!(cpu.pc, 0xC000);
        assert_eq!(cpu.sp, 0xFA);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x00);
    }

    #[test]
    fn brk_and_rti_round_trip() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x00, 0xFF, 0xEA]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0x90;
        bus.mem[0x9000] = 0x40;

        assert_eq!(step(&mut cpu, &mut bus), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(bus.mem[0x01FB] & FLAG_BREAK, FLAG_BREAK);

        assert_eq!(step(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.pc, 0x8002);
    }

    #[test]
    fn jsr_and_rts_return_after_call() {
        // JSR $8010; at $8010: RTS
        let mut program = vec![0x20, 0x10, 0x80];
        program.resize(0x10, 0xEA);
        program.push(0x60);
        let (mut cpu, mut bus) = boot(0x8000, &program);

        assert_eq!(step(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.pc, 0x8010);
        assert_eq!(step(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.pc, 0x8003);
    }

    #[test]
    fn unofficial_opcodes_are_defined_no_ops() {
        // LDX #$01; NOP $10FF,X (page cross); KIL-slot $02; SBC #$01 via $EB
        let (mut cpu, mut bus) = boot(0x8000, &[0xA2, 0x01, 0xFC, 0xFF, 0x10, 0x02, 0x38, 0xEB, 0x01]);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 5);
        assert_eq!(cpu.pc, 0x8005);

        let before = cpu.registers();
        assert_eq!(step(&mut cpu, &mut bus), 2);
        assert_eq!(cpu.registers().pc, before.pc + 1);
        assert_eq!(cpu.registers().a, before.a);

        cpu.a = 0x05;
        step(&mut cpu, &mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.a, 0x04);
    }

    #[test]
    fn disassembles_common_modes() {
        let bus = FlatBus::with_program(0x8000, &[0xBD, 0x34, 0x12, 0xD0, 0xFE, 0xA9, 0x07]);
        assert_eq!(disassemble(&bus, 0x8000), ("LDA $1234,X".to_string(), 0x8003));
        assert_eq!(disassemble(&bus, 0x8003), ("BNE $8003".to_string(), 0x8005));
        assert_eq!(disassemble(&bus, 0x8005), ("LDA #$07".to_string(), 0x8007));
    }
}
