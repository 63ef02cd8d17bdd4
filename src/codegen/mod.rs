//! Generación de código NASM x86 de 32 bits.
//!
//! El generador recorre el AST una sola vez y emite texto. Invariantes
//! del recorrido:
//!
//! - Al entrar y salir de cada sentencia, el conjunto de registros
//!   enteros está completamente libre y la pila x87 está vacía.
//! - Nunca se emite un movimiento memoria a memoria; un registro
//!   entero de paso sirve de intermediario.
//! - Nunca se emite `cmp` con dos operandos de memoria.
//!
//! Las variables viven en el stack frame de `_asm_main`, direccionadas
//! como `ebp - (offset + tamaño)`. Los literales van a `.data`, los
//! temporales a `.bss`, y las llamadas usan cdecl contra una librería
//! de runtime externa cuyos símbolos se invocan por nombre decorado.

mod asm;
mod literals;
mod regs;
mod temps;

use crate::{
    parse::{BinOp, Labels, Node, NodeKind},
    symbols::{Symbol, SymbolTable},
};

use asm::{AsmWriter, Operand, INT_SIZE, REAL_SIZE};
use literals::Literals;
use regs::{Class, Reg, RegisterError, RegisterFile};
use temps::TempPool;

use std::io::{self, Write};

use thiserror::Error;

/// Error del generador. Todos son fatales: el agotamiento de
/// registros es un límite real del esquema de asignación, y el resto
/// señala un bug del parser.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum GenError {
    #[error("I/O error while emitting assembly")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Registers(#[from] RegisterError),

    #[error("Cannot assign to an immediate location")]
    AssignToImmediate,

    #[error("Refusing to move from memory to memory")]
    MemToMem,

    #[error("`if` condition did not produce a comparison")]
    NotAComparison,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Unhandled node in code generation: {0}")]
    Unhandled(String),
}

/* Las funciones de la librería de C reciben double. Con reales de 4
 * bytes se llama en su lugar a trampolines externos `_nombre32` que
 * convierten float a double y de vuelta. */
const DOUBLE_MATH: &[&str] = &[
    "exp", "sin", "cos", "sqrt", "round", "iround", "writef", "writelnf",
];

pub struct CodeGen<'a, W: Write> {
    w: AsmWriter<W>,
    symbols: &'a SymbolTable,
    labels: Labels,
    regs: RegisterFile,
    temps: TempPool,
    strings: Literals<String>,
    floats: Literals<f64>,
    debug: bool,
}

impl<'a, W: Write> CodeGen<'a, W> {
    /// Crea un generador sobre la tabla de símbolos del parser (solo
    /// lectura) y su propia copia de la lista de etiquetas, para que
    /// las etiquetas generadas continúen desde la marca correcta.
    pub fn new(symbols: &'a SymbolTable, labels: Labels, output: W, debug: bool) -> Self {
        CodeGen {
            w: AsmWriter::new(output),
            symbols,
            labels,
            regs: RegisterFile::default(),
            temps: TempPool::new(),
            strings: Literals::new("STRING"),
            floats: Literals::new("FLOAT"),
            debug,
        }
    }

    /// Emite el listado completo: prólogo, código, epílogo y las
    /// secciones de datos.
    pub fn write(mut self, ast: &Node) -> Result<(), GenError> {
        if self.debug {
            self.dump_debug(ast)?;
        }

        self.prologue()?;
        self.gen_stmt(ast)?;
        self.epilogue()?;
        self.data_section()?;
        self.bss_section()?;
        Ok(())
    }

    fn dump_debug(&mut self, ast: &Node) -> Result<(), GenError> {
        for line in ast.sexpr_pretty(0).lines() {
            self.w.comment(line)?;
        }
        for level in 0..2 {
            for line in self.symbols.level_dump(level).lines() {
                self.w.comment(line)?;
            }
        }
        Ok(())
    }

    fn prologue(&mut self) -> Result<(), GenError> {
        self.w.line("%include \"pascal.inc\"")?;
        self.w.line("segment .text")?;
        self.w.line("    global _asm_main")?;
        self.w.label("_asm_main")?;

        // Las variables viven al inicio del stack frame; se les hace
        // campo moviendo esp
        self.w.push(&Operand::reg(Reg::Ebp))?;
        self.mov(&Operand::reg(Reg::Ebp), &Operand::reg(Reg::Esp))?;
        let frame = self.symbols.frame_size();
        self.w.make_stack_room(frame)?;
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), GenError> {
        self.w.set_comment("set exit value");
        self.mov(&Operand::reg(Reg::Eax), &Operand::imm(0))?;
        self.mov(&Operand::reg(Reg::Esp), &Operand::reg(Reg::Ebp))?;
        self.w.pop(&Operand::reg(Reg::Ebp))?;
        self.w.op0("ret")?;
        Ok(())
    }

    fn data_section(&mut self) -> Result<(), GenError> {
        let CodeGen { w, strings, floats, .. } = self;

        w.line("")?;
        w.line("segment .data")?;
        for (label, value) in strings.iter() {
            w.line(&format!("    {} db \"{}\", 0", label, value))?;
        }
        for (label, value) in floats.iter() {
            w.line(&format!("    {} dd {}", label, float_repr(*value)))?;
        }
        Ok(())
    }

    fn bss_section(&mut self) -> Result<(), GenError> {
        let CodeGen { w, temps, .. } = self;

        w.line("")?;
        w.line("segment .bss")?;
        for (size, count) in temps.iter() {
            for index in 0..count {
                w.line(&format!("    {} resb {}", TempPool::label(size, index), size))?;
            }
        }
        Ok(())
    }

    /// Emite `mov`, con la guarda de que nunca haya memoria en ambos
    /// lados: los llamadores ya pasan por un registro de paso.
    fn mov(&mut self, dst: &Operand, src: &Operand) -> Result<(), GenError> {
        if dst.is_mem() && src.is_mem() {
            return Err(GenError::MemToMem);
        }
        self.w.op2("mov", dst, src)?;
        Ok(())
    }

    // ------------------------------------------------------------
    // Sentencias
    // ------------------------------------------------------------

    fn gen_stmt(&mut self, node: &Node) -> Result<(), GenError> {
        if self.debug {
            self.w.comment(&format!("genCode() for {}", node.head()))?;
        }

        match &node.kind {
            NodeKind::Program(_) => self.gen_stmt(&node.children[0]),

            NodeKind::Progn => {
                for child in &node.children {
                    self.gen_stmt(child)?;
                    // Frontera de sentencia: todos los enteros libres
                    self.regs.free_all();
                }
                Ok(())
            }

            NodeKind::Binary(BinOp::Assign) => self.gen_assign(node),

            NodeKind::If => self.gen_if(node),

            NodeKind::Label(index) => {
                self.w.label(&format!("L{}", index))?;
                Ok(())
            }

            NodeKind::Goto(index) => {
                self.w.op_label("jmp", &format!("L{}", index))?;
                Ok(())
            }

            // Llamada en posición de sentencia; el resultado (si lo
            // hay) se descarta
            NodeKind::Funcall(_) => self.gen_funcall(node).map(|_| ()),

            NodeKind::Empty => Ok(()),

            _ => Err(GenError::Unhandled(node.sexpr())),
        }
    }

    fn gen_assign(&mut self, node: &Node) -> Result<(), GenError> {
        let left = self.gen_expr(&node.children[0])?;
        let right = self.gen_expr(&node.children[1])?;

        if left.is_immediate() {
            return Err(GenError::AssignToImmediate);
        }

        if right.is_st0() {
            self.assign_comment(node, &right);
            self.w.op1("fstp", &left)?;
        } else if left.is_mem() && right.is_mem() {
            // No hay mov memoria a memoria; salvo que sean la misma celda
            if left != right {
                let scratch = Operand::reg(self.regs.acquire(Class::Int)?);
                self.mov(&scratch, &right)?;
                self.assign_comment(node, &right);
                self.mov(&left, &scratch)?;
                self.regs.free(scratch.register());
            }
        } else {
            self.assign_comment(node, &right);
            self.mov(&left, &right)?;
        }

        self.regs.free_all();
        Ok(())
    }

    fn assign_comment(&mut self, node: &Node, right: &Operand) {
        if let NodeKind::Var(name) = &node.children[0].kind {
            self.w.set_comment(format!("{} = {}", name, right));
        }
    }

    fn gen_if(&mut self, node: &Node) -> Result<(), GenError> {
        let jump = self.gen_compare(&node.children[0])?;

        let branch = self.labels.fresh();
        let then_label = format!("THEN_CLAUSE{}", branch);
        let endif_label = format!("ENDIF{}", branch);

        self.w.op_label(jump, &then_label)?;
        if let Some(else_branch) = node.children.get(2) {
            self.gen_stmt(else_branch)?;
        } else {
            self.w.comment("no else branch")?;
        }
        self.w.op_label("jmp", &endif_label)?;
        self.w.label(&then_label)?;
        self.gen_stmt(&node.children[1])?;
        self.w.label(&endif_label)?;
        Ok(())
    }

    /// Genera ambos lados y emite `cmp`; devuelve el mnemónico de
    /// salto condicional que corresponde a la comparación.
    fn gen_compare(&mut self, node: &Node) -> Result<&'static str, GenError> {
        let op = match node.kind {
            NodeKind::Binary(op) if op.is_comparison() => op,
            _ => return Err(GenError::NotAComparison),
        };

        let left = self.gen_expr(&node.children[0])?;
        let mut right = self.gen_expr(&node.children[1])?;

        if left.is_mem() && right.is_mem() {
            let scratch = Operand::reg(self.regs.acquire(Class::Int)?);
            self.mov(&scratch, &right)?;
            right = scratch;
        }

        if let NodeKind::Var(name) = &node.children[0].kind {
            self.w.set_comment(format!("{} {} {}?", name, op, right));
        } else {
            self.w.set_comment(format!("{} {} {}?", left, op, right));
        }
        self.w.op2("cmp", &left, &right)?;
        self.regs.free(left.register());
        self.regs.free(right.register());

        Ok(match op {
            BinOp::Eq => "je",
            BinOp::Ne => "jne",
            BinOp::Lt => "jl",
            BinOp::Le => "jle",
            BinOp::Gt => "jg",
            BinOp::Ge => "jge",
            _ => unreachable!("not a comparison"),
        })
    }

    // ------------------------------------------------------------
    // Expresiones
    // ------------------------------------------------------------

    fn gen_expr(&mut self, node: &Node) -> Result<Operand, GenError> {
        if self.debug {
            self.w.comment(&format!("genExpr() for {}", node.head()))?;
        }

        match &node.kind {
            NodeKind::Var(_) => self.gen_identifier(node),

            NodeKind::Binary(BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
            | NodeKind::Neg => self.gen_arith(node),

            NodeKind::CastReal | NodeKind::CastInt => self.gen_cast(node),

            NodeKind::Funcall(_) => self
                .gen_funcall(node)?
                .ok_or(GenError::Unsupported("void function call in expression")),

            NodeKind::Int(value) => Ok(Operand::imm(*value)),

            NodeKind::Real(value) => {
                let label = self.floats.label(*value);
                Ok(Operand::mem(label, REAL_SIZE))
            }

            NodeKind::Str(value) => {
                let label = self.strings.label(value.clone());
                Ok(Operand::sym(label))
            }

            NodeKind::Aref => self.gen_aref(node),

            NodeKind::Deref => self.gen_deref(node),

            _ => Err(GenError::Unhandled(node.sexpr())),
        }
    }

    /// Una variable se resuelve a la dirección `ebp - (offset + tamaño)`
    /// en un registro recién adquirido, marcado para dereferencia.
    fn gen_identifier(&mut self, node: &Node) -> Result<Operand, GenError> {
        let (name, offset, size) = match self.symbols.get(node.symbol) {
            Symbol::Var { name, offset, size, .. } => (name.clone(), *offset, *size),
            _ => return Err(GenError::Unhandled(node.sexpr())),
        };

        let reg = self.regs.acquire(Class::Int)?;
        let mut address = Operand::reg(reg);
        self.mov(&address, &Operand::reg(Reg::Ebp))?;
        self.w.set_comment(format!("{} = &{}", reg, name));
        self.w
            .op2("sub", &address, &Operand::imm((offset + size) as i32))?;
        address.set_deref();
        Ok(address)
    }

    /// `AREF base offset`: suma el offset sobre el registro de la
    /// base sin dereferenciarlo, y devuelve la base marcada para
    /// dereferencia automática.
    fn gen_aref(&mut self, node: &Node) -> Result<Operand, GenError> {
        let mut base = self.gen_expr(&node.children[0])?;
        let offset = self.gen_expr(&node.children[1])?;

        base.set_no_deref();
        self.w.op2("add", &base, &offset)?;
        self.regs.free(offset.register());
        base.clear_no_deref();

        base.set_deref();
        Ok(base)
    }

    /// `p^`: carga el valor apuntado (una dirección) en un registro
    /// fresco y lo devuelve como operando de dirección.
    fn gen_deref(&mut self, node: &Node) -> Result<Operand, GenError> {
        let child = &node.children[0];
        if !matches!(child.kind, NodeKind::Var(_) | NodeKind::Aref | NodeKind::Deref) {
            return Err(GenError::Unhandled(node.sexpr()));
        }

        let address = Operand::reg(self.regs.acquire(Class::Int)?);
        let mut pointer = self.gen_expr(child)?;
        pointer.set_deref();
        if let NodeKind::Var(name) = &child.kind {
            self.w.set_comment(format!("{} = {}", address, name));
        }
        self.mov(&address, &pointer)?;
        self.regs.free(pointer.register());
        Ok(address)
    }

    fn gen_arith(&mut self, node: &Node) -> Result<Operand, GenError> {
        if node.ty == self.symbols.real {
            self.gen_float_arith(node)
        } else {
            self.gen_int_arith(node)
        }
    }

    fn gen_int_arith(&mut self, node: &Node) -> Result<Operand, GenError> {
        let left = self.gen_expr(&node.children[0])?;
        let right = match node.children.get(1) {
            Some(child) => Some(self.gen_expr(child)?),
            None => None,
        };

        // Cuidado con escribir sobre left si es una celda de memoria
        let dest = Operand::reg(self.regs.acquire(Class::Int)?);
        self.mov(&dest, &left)?;
        self.regs.free(left.register());

        match (&node.kind, &right) {
            (NodeKind::Binary(BinOp::Add), Some(right)) => self.w.op2("add", &dest, right)?,
            (NodeKind::Binary(BinOp::Sub), Some(right)) => self.w.op2("sub", &dest, right)?,
            (NodeKind::Binary(BinOp::Mul), Some(right)) => self.w.op2("imul", &dest, right)?,
            (NodeKind::Binary(BinOp::Div), Some(_)) => {
                return Err(GenError::Unsupported("integer division"))
            }
            (NodeKind::Neg, None) => self.w.op1("neg", &dest)?,
            _ => return Err(GenError::Unhandled(node.sexpr())),
        }

        if let Some(right) = right {
            self.regs.free(right.register());
        }
        Ok(dest)
    }

    /// Aritmética real sobre la pila x87: ambos operandos se suben a
    /// `st0` (el anterior baja a `st1`) y se opera con la forma que
    /// desapila. El resultado queda en `st0`.
    fn gen_float_arith(&mut self, node: &Node) -> Result<Operand, GenError> {
        let left = self.gen_expr(&node.children[0])?;
        self.float_to_fpu(&left)?;

        let right = match node.children.get(1) {
            Some(child) => {
                let right = self.gen_expr(child)?;
                self.float_to_fpu(&right)?;
                Some(right)
            }
            None => None,
        };

        match (&node.kind, &right) {
            (NodeKind::Binary(BinOp::Add), Some(_)) => self.w.op1("faddp", &Operand::st1())?,
            (NodeKind::Binary(BinOp::Sub), Some(_)) => self.w.op1("fsubp", &Operand::st1())?,
            (NodeKind::Binary(BinOp::Mul), Some(_)) => self.w.op1("fmulp", &Operand::st1())?,
            (NodeKind::Binary(BinOp::Div), Some(_)) => self.w.op1("fdivp", &Operand::st1())?,
            (NodeKind::Neg, None) => self.w.op0("fchs")?,
            _ => return Err(GenError::Unhandled(node.sexpr())),
        }

        self.regs.free(left.register());
        if let Some(right) = right {
            self.regs.free(right.register());
        }
        Ok(Operand::st0())
    }

    fn gen_cast(&mut self, node: &Node) -> Result<Operand, GenError> {
        match node.kind {
            NodeKind::CastReal => {
                let arg = self.gen_expr(&node.children[0])?;
                self.int_to_fpu(&arg)?;
                Ok(Operand::st0())
            }

            NodeKind::CastInt => {
                let arg = self.gen_expr(&node.children[0])?;
                self.float_to_fpu(&arg)?;
                self.regs.free(arg.register());
                let slot = self.temps.acquire(INT_SIZE.bytes());
                let memory = Operand::mem(slot, INT_SIZE);
                self.w.op1("fistp", &memory)?;
                Ok(memory)
            }

            _ => Err(GenError::Unhandled(node.sexpr())),
        }
    }

    /// Sube un entero a la pila x87. `fild` solo acepta memoria, así
    /// que inmediatos y registros pasan por un slot temporal.
    fn int_to_fpu(&mut self, operand: &Operand) -> Result<(), GenError> {
        if operand.is_mem() {
            self.w.op1("fild", operand)?;
        } else if operand.is_immediate() {
            let slot = self.temps.acquire(INT_SIZE.bytes());
            let memory = Operand::mem(slot, INT_SIZE);
            self.mov(&memory, operand)?;
            self.w.op1("fild", &memory)?;
            self.temps.free(INT_SIZE.bytes());
        } else if let Some(reg) = operand.register() {
            if reg != Reg::St0 {
                let slot = self.temps.acquire(INT_SIZE.bytes());
                let memory = Operand::mem(slot, INT_SIZE);
                self.mov(&memory, operand)?;
                self.w.op1("fild", &memory)?;
                self.regs.free(Some(reg));
                self.temps.free(INT_SIZE.bytes());
            }
        }
        Ok(())
    }

    /// Sube un real a la pila x87, salvo que ya esté en `st0`.
    fn float_to_fpu(&mut self, operand: &Operand) -> Result<(), GenError> {
        if operand.is_mem() {
            self.w.op1("fld", operand)?;
        } else if operand.is_immediate() {
            let slot = self.temps.acquire(REAL_SIZE.bytes());
            let memory = Operand::mem(slot, REAL_SIZE);
            self.mov(&memory, operand)?;
            self.w.op1("fld", &memory)?;
            self.temps.free(REAL_SIZE.bytes());
        } else if let Some(reg) = operand.register() {
            if reg != Reg::St0 {
                return Err(GenError::Unsupported("real value in a general register"));
            }
        }
        Ok(())
    }

    /// Llamada cdecl: preserva `eax` si está en uso, apila los
    /// argumentos (en orden inverso de fuente) y limpia el stack tras
    /// el `call`. Un resultado real queda en `st0`; uno entero en
    /// `eax` o en un registro fresco si `eax` debía restaurarse.
    fn gen_funcall(&mut self, node: &Node) -> Result<Option<Operand>, GenError> {
        let (name, result) = match self.symbols.get(node.symbol) {
            Symbol::Function { name, result, .. } => (name.clone(), *result),
            _ => return Err(GenError::Unhandled(node.sexpr())),
        };

        let eax = Operand::reg(Reg::Eax);
        let eax_busy = self.regs.is_acquired(Reg::Eax);
        if eax_busy {
            self.w.set_comment("save eax for function call");
            self.w.push(&eax)?;
        }

        let mut pushed = 0;
        for child in node.children.iter().rev() {
            let argument = self.gen_expr(child)?;
            if argument.is_st0() {
                // Un real baja de la pila x87 directo al stack
                self.w.make_stack_room(REAL_SIZE.bytes())?;
                let mut slot = Operand::reg(Reg::Esp);
                slot.set_deref();
                self.w.op1("fstp", &slot)?;
                pushed += REAL_SIZE.bytes();
            } else {
                self.w.push(&argument)?;
                pushed += INT_SIZE.bytes();
            }
        }

        let target = self.mangled(&name);
        self.w.op_label("call", &target)?;
        self.w.clear_stack_room(pushed)?;

        let result = self.symbols.resolve(result);
        if result == self.symbols.real {
            Ok(Some(Operand::st0()))
        } else if !result.is_null() {
            if eax_busy {
                // El resultado se muda a otro registro: el eax
                // restaurado debe conservar su valor previo
                let out = Operand::reg(self.regs.acquire(Class::Int)?);
                self.mov(&out, &eax)?;
                self.w.pop(&eax)?;
                Ok(Some(out))
            } else {
                self.regs.acquire_specific(Reg::Eax);
                Ok(Some(eax))
            }
        } else {
            Ok(None)
        }
    }

    /// Nombre visible para el linker: las integradas llevan `_` al
    /// frente, y las de matemática de double el sufijo `32` que
    /// selecciona el trampolín para reales de 4 bytes.
    fn mangled(&self, name: &str) -> String {
        if self.symbols.in_level_zero(name) {
            if REAL_SIZE.bytes() == 4 && DOUBLE_MATH.contains(&name) {
                return format!("_{}32", name);
            }
            return format!("_{}", name);
        }
        name.to_owned()
    }
}

/// NASM interpreta `dd 3` como entero: los reales se escriben siempre
/// con punto decimal.
fn float_repr(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_literals_always_carry_a_decimal_point() {
        assert_eq!(float_repr(3.0), "3.0");
        assert_eq!(float_repr(0.5), "0.5");
        assert_eq!(float_repr(-2.0), "-2.0");
    }

    #[test]
    fn level_zero_names_are_mangled() {
        let symbols = SymbolTable::new();
        let gen = CodeGen::new(&symbols, Labels::default(), Vec::new(), false);

        assert_eq!(gen.mangled("writelni"), "_writelni");
        assert_eq!(gen.mangled("writef"), "_writef32");
        assert_eq!(gen.mangled("sqrt"), "_sqrt32");
        assert_eq!(gen.mangled("new"), "_new");
        assert_eq!(gen.mangled("user"), "user");
    }
}
