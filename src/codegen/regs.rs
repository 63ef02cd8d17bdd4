//! Administración de registros.
//!
//! El archivo de registros es fijo y ordenado; adquirir un registro
//! recorre la lista y entrega el primero libre de la clase pedida,
//! saltando los registros especiales (`ebp`, `esp`). Los registros
//! x87 también se administran por adquisición, aunque en la práctica
//! solo `st0` y `st1` se referencian.

use std::fmt::{self, Display};

use thiserror::Error;

/// Registro de procesador x86 de 32 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Eax,
    Ebp,
    Esp,
    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,
}

/// Clase de datos que un registro puede contener.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Class {
    Int,
    Float,
}

impl Reg {
    /// Orden de búsqueda para la adquisición. `eax` va de último
    /// entre los enteros para que las llamadas a funciones rara vez
    /// tengan que preservarlo.
    pub const FILE: &'static [Reg] = &[
        Reg::Ebx,
        Reg::Ecx,
        Reg::Edx,
        Reg::Esi,
        Reg::Edi,
        Reg::Eax,
        Reg::Ebp,
        Reg::Esp,
        Reg::St0,
        Reg::St1,
        Reg::St2,
        Reg::St3,
        Reg::St4,
        Reg::St5,
        Reg::St6,
        Reg::St7,
    ];

    pub fn class(self) -> Class {
        match self {
            Reg::Ebx
            | Reg::Ecx
            | Reg::Edx
            | Reg::Esi
            | Reg::Edi
            | Reg::Eax
            | Reg::Ebp
            | Reg::Esp => Class::Int,
            _ => Class::Float,
        }
    }

    /// `ebp` y `esp` nunca se entregan: sostienen el stack frame.
    fn is_special(self) -> bool {
        matches!(self, Reg::Ebp | Reg::Esp)
    }
}

impl Display for Reg {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Ebx => "ebx",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
            Reg::Eax => "eax",
            Reg::Ebp => "ebp",
            Reg::Esp => "esp",
            Reg::St0 => "st0",
            Reg::St1 => "st1",
            Reg::St2 => "st2",
            Reg::St3 => "st3",
            Reg::St4 => "st4",
            Reg::St5 => "st5",
            Reg::St6 => "st6",
            Reg::St7 => "st7",
        };

        fmt.write_str(name)
    }
}

/// Agotamiento de registros. El generador lo trata como fatal.
#[derive(Error, Debug)]
#[error("Failed to acquire a register of class {0:?}")]
pub struct RegisterError(pub Class);

/// Conjunto de registros actualmente adquiridos.
#[derive(Default)]
pub struct RegisterFile {
    acquired: Vec<Reg>,
}

impl RegisterFile {
    pub fn is_acquired(&self, reg: Reg) -> bool {
        self.acquired.contains(&reg)
    }

    /// Entrega el primer registro libre de la clase pedida.
    pub fn acquire(&mut self, class: Class) -> Result<Reg, RegisterError> {
        for &reg in Reg::FILE {
            if reg.class() == class && !reg.is_special() && !self.is_acquired(reg) {
                self.acquired.push(reg);
                return Ok(reg);
            }
        }

        Err(RegisterError(class))
    }

    /// Marca un registro puntual como adquirido, por ejemplo `eax`
    /// cuando contiene el resultado de una llamada.
    pub fn acquire_specific(&mut self, reg: Reg) {
        if !self.is_acquired(reg) {
            self.acquired.push(reg);
        }
    }

    /// Libera un registro; `None` es una no-operación.
    pub fn free(&mut self, reg: Option<Reg>) {
        if let Some(reg) = reg {
            self.acquired.retain(|&r| r != reg);
        }
    }

    /// Libera todo el conjunto. Se usa en cada frontera de sentencia.
    pub fn free_all(&mut self) {
        self.acquired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_order_leaves_eax_for_last() {
        let mut regs = RegisterFile::default();
        let order: Vec<Reg> = (0..6).map(|_| regs.acquire(Class::Int).unwrap()).collect();
        assert_eq!(
            order,
            vec![Reg::Ebx, Reg::Ecx, Reg::Edx, Reg::Esi, Reg::Edi, Reg::Eax]
        );
        assert!(regs.acquire(Class::Int).is_err());
    }

    #[test]
    fn special_registers_are_never_handed_out() {
        let mut regs = RegisterFile::default();
        while let Ok(reg) = regs.acquire(Class::Int) {
            assert!(!matches!(reg, Reg::Ebp | Reg::Esp));
        }
    }

    #[test]
    fn freeing_returns_a_register_to_the_pool() {
        let mut regs = RegisterFile::default();
        let first = regs.acquire(Class::Int).unwrap();
        regs.free(Some(first));
        assert_eq!(regs.acquire(Class::Int).unwrap(), first);

        regs.free(None); // no-op
        regs.free_all();
        assert!(!regs.is_acquired(first));
    }

    #[test]
    fn float_class_scans_the_fpu_stack() {
        let mut regs = RegisterFile::default();
        assert_eq!(regs.acquire(Class::Float).unwrap(), Reg::St0);
        assert_eq!(regs.acquire(Class::Float).unwrap(), Reg::St1);
    }
}
