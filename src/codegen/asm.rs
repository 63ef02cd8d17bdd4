//! Operandos y escritura de ensamblador NASM.
//!
//! Un [`Operand`] describe un inmediato, un registro o una celda de
//! memoria, junto con las restricciones de dereferencia que guían su
//! forma textual: un registro marcado `deref` se escribe
//! `dword [reg]`, y la marca `no_deref` fuerza la forma plana sin
//! corchetes mientras se calcula una dirección.

use std::fmt::{self, Display};
use std::io::{self, Write};

use super::regs::Reg;

/// Columna donde se alinean los comentarios en línea.
const COMMENT_COLUMN: usize = 40;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OpSize {
    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword => 4,
            OpSize::Qword => 8,
        }
    }

    /// Calificador de memoria NASM.
    fn mem_keyword(self) -> &'static str {
        match self {
            OpSize::Byte => "byte",
            OpSize::Word => "word",
            OpSize::Dword => "dword",
            OpSize::Qword => "qword",
        }
    }
}

pub const INT_SIZE: OpSize = OpSize::Dword;
pub const REAL_SIZE: OpSize = OpSize::Dword;

#[derive(Clone, Debug, PartialEq)]
enum Place {
    Imm(i32),
    Reg(Reg),
    /// Memoria direccionada por etiqueta.
    Mem(String),
    /// Etiqueta usada como inmediato: la dirección misma.
    Sym(String),
}

impl Display for Place {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Imm(value) => write!(fmt, "{}", value),
            Place::Reg(reg) => write!(fmt, "{}", reg),
            Place::Mem(label) | Place::Sym(label) => fmt.write_str(label),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    place: Place,
    size: OpSize,
    deref: bool,
    no_deref: bool,
}

impl Operand {
    pub fn imm(value: i32) -> Self {
        Operand {
            place: Place::Imm(value),
            size: INT_SIZE,
            deref: false,
            no_deref: false,
        }
    }

    pub fn reg(reg: Reg) -> Self {
        Operand {
            place: Place::Reg(reg),
            size: INT_SIZE,
            deref: false,
            no_deref: false,
        }
    }

    pub fn mem(label: impl Into<String>, size: OpSize) -> Self {
        Operand {
            place: Place::Mem(label.into()),
            size,
            deref: false,
            no_deref: false,
        }
    }

    pub fn sym(label: impl Into<String>) -> Self {
        Operand {
            place: Place::Sym(label.into()),
            size: INT_SIZE,
            deref: false,
            no_deref: false,
        }
    }

    pub fn st0() -> Self {
        Operand::reg(Reg::St0)
    }

    pub fn st1() -> Self {
        Operand::reg(Reg::St1)
    }

    pub fn register(&self) -> Option<Reg> {
        match self.place {
            Place::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.place, Place::Imm(_) | Place::Sym(_))
    }

    pub fn is_st0(&self) -> bool {
        self.register() == Some(Reg::St0)
    }

    /// Un operando que lee o escribe memoria al usarse.
    pub fn is_mem(&self) -> bool {
        !self.no_deref && (matches!(self.place, Place::Mem(_)) || self.deref)
    }

    pub fn set_deref(&mut self) {
        self.deref = true;
    }

    pub fn set_no_deref(&mut self) {
        self.no_deref = true;
    }

    pub fn clear_no_deref(&mut self) {
        self.no_deref = false;
    }
}

impl Display for Operand {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_deref {
            write!(fmt, "{}", self.place)
        } else if matches!(self.place, Place::Mem(_)) {
            write!(fmt, "{} [{}]", self.size.mem_keyword(), self.place)
        } else if matches!(self.place, Place::Reg(_)) && self.deref {
            write!(fmt, "{} [{}]", self.size.mem_keyword(), self.place)
        } else {
            write!(fmt, "{}", self.place)
        }
    }
}

/// Escritor de listado NASM con comentarios pendientes.
///
/// `set_comment` registra un comentario que se adjunta, alineado a
/// una columna fija, a la siguiente línea emitida.
pub struct AsmWriter<W: Write> {
    out: W,
    comment: Option<String>,
}

impl<W: Write> AsmWriter<W> {
    pub fn new(out: W) -> Self {
        AsmWriter { out, comment: None }
    }

    /// Comentario en línea para la próxima instrucción.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    /// Comentario en su propia línea.
    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "; {}", text)
    }

    /// Emite una línea, aplicando el comentario pendiente si lo hay.
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        match self.comment.take() {
            Some(comment) => writeln!(
                self.out,
                "{:width$}; {}",
                text,
                comment,
                width = COMMENT_COLUMN
            ),
            None => writeln!(self.out, "{}", text),
        }
    }

    fn instr(&mut self, instr: &str, operands: &str) -> io::Result<()> {
        if operands.is_empty() {
            self.line(&format!("    {}", instr))
        } else {
            self.line(&format!("    {:<8}{}", instr, operands))
        }
    }

    pub fn op0(&mut self, instr: &str) -> io::Result<()> {
        self.instr(instr, "")
    }

    pub fn op1(&mut self, instr: &str, a: &Operand) -> io::Result<()> {
        self.instr(instr, &a.to_string())
    }

    pub fn op2(&mut self, instr: &str, a: &Operand, b: &Operand) -> io::Result<()> {
        self.instr(instr, &format!("{}, {}", a, b))
    }

    /// Instrucción con una etiqueta como operando (saltos, call).
    pub fn op_label(&mut self, instr: &str, label: &str) -> io::Result<()> {
        self.instr(instr, label)
    }

    pub fn label(&mut self, label: &str) -> io::Result<()> {
        self.line(&format!("{}:", label))
    }

    pub fn push(&mut self, operand: &Operand) -> io::Result<()> {
        self.op1("push", operand)
    }

    pub fn pop(&mut self, operand: &Operand) -> io::Result<()> {
        self.op1("pop", operand)
    }

    /// Reserva espacio de stack moviendo `esp`.
    pub fn make_stack_room(&mut self, bytes: u32) -> io::Result<()> {
        if bytes > 0 {
            self.op2("sub", &Operand::reg(Reg::Esp), &Operand::imm(bytes as i32))?;
        }
        Ok(())
    }

    /// Libera espacio de stack previamente reservado.
    pub fn clear_stack_room(&mut self, bytes: u32) -> io::Result<()> {
        if bytes > 0 {
            self.op2("add", &Operand::reg(Reg::Esp), &Operand::imm(bytes as i32))?;
        }
        Ok(())
    }
}
