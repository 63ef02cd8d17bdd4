//! Almacenamiento temporal en `.bss`.
//!
//! El generador a veces necesita una celda de memoria transitoria,
//! en particular para subir enteros a la pila flotante: `fild` solo
//! acepta operandos de memoria. Cada tamaño en bytes posee su propia
//! lista de slots con banderas de ocupación; adquirir devuelve el
//! primer slot libre de ese tamaño, creando uno nuevo si no lo hay.

use std::collections::BTreeMap;

pub struct TempPool {
    slots: BTreeMap<u32, Vec<bool>>,
}

impl TempPool {
    pub fn new() -> Self {
        TempPool {
            slots: BTreeMap::new(),
        }
    }

    /// Etiqueta de un slot: `TMP_<tamaño>_<índice>`.
    pub fn label(size: u32, index: usize) -> String {
        format!("TMP_{}_{}", size, index)
    }

    /// Devuelve la etiqueta del primer slot libre de `size` bytes.
    pub fn acquire(&mut self, size: u32) -> String {
        let slots = self.slots.entry(size).or_default();
        match slots.iter().position(|&used| !used) {
            Some(index) => {
                slots[index] = true;
                Self::label(size, index)
            }
            None => {
                slots.push(true);
                Self::label(size, slots.len() - 1)
            }
        }
    }

    /// Libera un slot del tamaño dado.
    pub fn free(&mut self, size: u32) {
        if let Some(slots) = self.slots.get_mut(&size) {
            if let Some(index) = slots.iter().position(|&used| used) {
                slots[index] = false;
            }
        }
    }

    /// Itera `(tamaño, cantidad de slots)` para la emisión de `.bss`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.slots.iter().map(|(&size, slots)| (size, slots.len()))
    }
}

impl Default for TempPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_after_free() {
        let mut pool = TempPool::new();
        assert_eq!(pool.acquire(4), "TMP_4_0");
        assert_eq!(pool.acquire(4), "TMP_4_1");
        pool.free(4);
        assert_eq!(pool.acquire(4), "TMP_4_0");
        assert_eq!(pool.acquire(4), "TMP_4_2");
    }

    #[test]
    fn sizes_own_separate_lists() {
        let mut pool = TempPool::new();
        assert_eq!(pool.acquire(4), "TMP_4_0");
        assert_eq!(pool.acquire(8), "TMP_8_0");
        assert_eq!(pool.iter().collect::<Vec<_>>(), vec![(4, 1), (8, 1)]);
    }
}
