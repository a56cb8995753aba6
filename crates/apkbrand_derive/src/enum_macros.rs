use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

use crate::utils::screaming_snake;

pub(crate) fn expand_enum_code(input: DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            ident,
            "EnumCode can only be derived for enums",
        ));
    };

    let mut variant_idents = Vec::with_capacity(data.variants.len());
    let mut codes = Vec::with_capacity(data.variants.len());

    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new_spanned(
                &variant.ident,
                "EnumCode variants must not carry fields",
            ));
        }

        let code = screaming_snake(&variant.ident.to_string());
        codes.push(LitStr::new(&code, variant.ident.span()));
        variant_idents.push(&variant.ident);
    }

    Ok(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            /// Every variant, in declaration order.
            pub const VARIANTS: &'static [Self] = &[#(Self::#variant_idents),*];

            /// The stable `SCREAMING_SNAKE_CASE` code of this variant.
            pub fn as_code(&self) -> &'static str {
                match self {
                    #(Self::#variant_idents => #codes,)*
                }
            }
        }

        impl #impl_generics ::std::fmt::Display for #ident #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_code())
            }
        }
    })
}
