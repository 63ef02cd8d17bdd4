//! Pools de literales con etiquetas únicas.
//!
//! Cadenas y flotantes viven en `.data` bajo etiquetas `STRING<i>` y
//! `FLOAT<i>`. La lista preserva el orden de inserción y literales
//! iguales comparten etiqueta.

pub struct Literals<T> {
    prefix: &'static str,
    values: Vec<T>,
}

impl<T: PartialEq> Literals<T> {
    pub fn new(prefix: &'static str) -> Self {
        Literals {
            prefix,
            values: Vec::new(),
        }
    }

    /// Etiqueta del literal, agregándolo si es nuevo.
    pub fn label(&mut self, value: T) -> String {
        let index = match self.values.iter().position(|known| *known == value) {
            Some(index) => index,
            None => {
                self.values.push(value);
                self.values.len() - 1
            }
        };

        format!("{}{}", self.prefix, index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (String, &T)> {
        self.values
            .iter()
            .enumerate()
            .map(|(index, value)| (format!("{}{}", self.prefix, index), value))
    }
}
