use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod enum_macros;
mod utils;

/// Derives a stable, machine-checkable code for a fieldless enum.
///
/// Each variant maps to its name in `SCREAMING_SNAKE_CASE` (`ExternalTool`
/// becomes `EXTERNAL_TOOL`). The derive generates:
///
/// - `fn as_code(&self) -> &'static str`
/// - `const VARIANTS: &'static [Self]`, in declaration order
/// - a `Display` impl that writes the code
#[proc_macro_derive(EnumCode)]
pub fn derive_enum_code(input: TokenStream) -> TokenStream {
    let derive_input = parse_macro_input!(input as DeriveInput);

    enum_macros::expand_enum_code(derive_input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
