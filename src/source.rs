//! Rastreo de ubicaciones originales en código fuente.
//!
//! Los distintos objetos internos que el compilador construye
//! deben llevar cuenta de posiciones o rangos de ubicaciones en
//! el código fuente original, lo cual permite determinar un punto
//! exacto o aproximado en donde ocurre un error de abstracción
//! arbitraria.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::Range,
    rc::Rc,
};

/// Ancho de los divisores de tabulador.
const TAB_STOP: u32 = 4;

/// Un objeto cualquiera con una posición original asociada.
#[derive(Debug, Clone)]
pub struct Located<T> {
    location: Location,
    value: T,
}

impl<T> Located<T> {
    /// Obtiene el valor.
    pub fn val(&self) -> &T {
        &self.value
    }

    /// Obtiene la ubicación.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Descarta la ubicación y toma ownership del valor.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Descompone y toma ownership de las dos partes.
    pub fn split(self) -> (Location, T) {
        (self.location, self.value)
    }

    /// Construye a partir de un valor y una ubicación.
    pub fn at(value: T, location: Location) -> Self {
        Located { value, location }
    }

    /// Transforma el valor con la misma ubicación.
    pub fn map<U, F>(self, map: F) -> Located<U>
    where
        F: FnOnce(T) -> U,
    {
        Located {
            value: map(self.value),
            location: self.location,
        }
    }
}

impl<T> AsRef<T> for Located<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

/// Una ubicación está conformada por un origen y un rango de posiciones.
#[derive(Clone)]
pub struct Location {
    from: Rc<str>,
    position: Range<Position>,
}

impl Location {
    /// Construye una ubicación puntual en un origen dado.
    pub fn point(from: Rc<str>, at: Position) -> Self {
        Location {
            from,
            position: at..at.advance(),
        }
    }

    /// Unifica un rango de ubicaciones. Se asume el mismo origen.
    pub fn span(from: Location, to: &Location) -> Self {
        Location {
            from: from.from,
            position: from.position.start..to.position.end,
        }
    }

    /// Obtiene el nombre del origen.
    pub fn source_name(&self) -> &str {
        &self.from
    }

    /// Obtiene la posición de inicio.
    pub fn start(&self) -> Position {
        self.position.start
    }

    /// Obtiene la posición de fin.
    pub fn end(&self) -> Position {
        self.position.end
    }
}

impl Display for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:", self.from)?;

        let Range { start, end } = self.position.clone();
        if end == start.advance() {
            // Solo se señala una columna en específico
            write!(formatter, "{}", start)
        } else {
            write!(formatter, "[{}-{}]", start, end.back())
        }
    }
}

impl Debug for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Una posición línea-columna en un archivo.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Position {
    /// Obtiene el número de línea.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Obtiene el número de columna.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Incrementa el número de columna.
    pub fn advance(self) -> Position {
        Position {
            line: self.line,
            column: self.column + 1,
        }
    }

    /// Decrementa el número de columna.
    pub fn back(self) -> Position {
        Position {
            line: self.line,
            column: self.column.saturating_sub(1).max(1),
        }
    }

    /// Incrementa el número de línea y retorna a la columna 1.
    pub fn newline(self) -> Position {
        Position {
            line: self.line + 1,
            column: 1,
        }
    }

    /// Ajusta la posición a la siguiente columna de tabulador.
    pub fn tab(self) -> Position {
        let column = 1 + ((self.column - 1) / TAB_STOP + 1) * TAB_STOP;
        Position {
            line: self.line,
            column,
        }
    }

    /// Avanza según el carácter encontrado en esta posición.
    pub fn after(self, c: char) -> Position {
        match c {
            '\n' => self.newline(),
            '\t' => self.tab(),
            _ => self.advance(),
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Display for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}
