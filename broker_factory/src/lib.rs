//! Procedural macros shared by the broker workspace for writing
//! human-oriented, custom `Deserialize` implementations on configuration
//! structs and enums without repeating the field-matching boilerplate by hand.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod common {
    pub mod parse;
}

mod config {
    pub mod choice;
    pub mod field {
        pub mod generator;
        pub mod input;
    }
}

/// Generates a private helper enum (and its `Deserialize` visitor glue) used to
/// match incoming configuration map keys against a fixed set of field names
/// (with optional aliases), using a caller-supplied case-insensitive (or
/// otherwise customized) string equality function.
///
/// Intended to be invoked from within a hand-written `Deserialize` impl for a
/// configuration struct; see [`broker_util::BackoffConfig`] for a canonical
/// usage example.
#[proc_macro]
pub fn impl_deserialize_field(input: TokenStream) -> TokenStream {
    config::field::generator::impl_deserialize_field(input)
}

/// Derives `Deserialize` for a unit-only enum by matching the incoming string
/// against each variant's name (or declared aliases) via the `#[field(eq_fn =
/// ..., alias = "...")]` attribute.
#[proc_macro_derive(ConfigChoice, attributes(field))]
pub fn config_choice(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match config::choice::config_choice(input) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}
