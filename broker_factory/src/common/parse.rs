use syn::punctuated::Punctuated;
use syn::{Meta, Token};

/// A shorthand for a sequence of comma-delimited attribute arguments
pub type Args = Punctuated<Meta, Token![,]>;
