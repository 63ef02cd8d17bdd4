//! Recolección y despliegue de diagnósticos.
//!
//! Los errores de usuario no detienen la compilación. Cada fase los
//! acumula en un [`Diagnostics`] y el proceso continúa en la medida
//! de lo posible. Solo los errores internos del generador de código
//! (agotamiento de registros, invariantes rotas) abortan.

use crate::source::{Located, Location};
use std::{
    error::Error,
    fmt::{self, Display},
};

mod sealed {
    pub trait Sealed {}
}

pub trait LocatedError: sealed::Sealed {
    fn source(&self) -> &dyn Error;
    fn location(&self) -> &Location;
}

#[derive(Default)]
pub struct Diagnostics(Vec<Box<dyn 'static + LocatedError>>);

impl Diagnostics {
    /// Agrega un diagnóstico a la colección.
    pub fn push<E: 'static + Error>(&mut self, error: Located<E>) {
        self.0.push(Box::new(error));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Absorbe los diagnósticos de otra colección.
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }
}

impl<E: 'static + LocatedError> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        Diagnostics(vec![Box::new(error)])
    }
}

impl<E: 'static + LocatedError> From<Vec<E>> for Diagnostics {
    fn from(errors: Vec<E>) -> Self {
        let errors = errors
            .into_iter()
            .map(|error| {
                let error: Box<dyn LocatedError> = Box::new(error);
                error
            })
            .collect();

        Diagnostics(errors)
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostics(errors) = self;
        if errors.is_empty() {
            return writeln!(fmt, "No errors were reported");
        }

        for error in errors {
            writeln!(fmt, "error: {}", error.source())?;
            writeln!(fmt, " --> {}", error.location())?;
        }

        let error_or_errors = if errors.len() == 1 { "error" } else { "errors" };
        writeln!(
            fmt,
            "Build finished with {} {}",
            errors.len(),
            error_or_errors
        )
    }
}

impl<E: Error> sealed::Sealed for Located<E> {}

impl<E: Error> LocatedError for Located<E> {
    fn source(&self) -> &dyn Error {
        self.val()
    }

    fn location(&self) -> &Location {
        Located::location(self)
    }
}
