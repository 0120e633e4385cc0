use proc_macro::TokenStream;
use quote::quote;
use syn::{Item, parse_macro_input};

extern crate proc_macro;

/// Stamps the derives every exported snapshot type needs: serde in both directions,
/// `Debug`, `Clone` and `PartialEq`.
///
/// Works on structs and enums. The annotated crate must depend on `serde`.
#[proc_macro_attribute]
pub fn snapshot(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as Item);
    match &ast {
        Item::Struct(_) | Item::Enum(_) => {}
        other => {
            return syn::Error::new_spanned(other, "#[snapshot] applies to structs and enums")
                .to_compile_error()
                .into();
        }
    }
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
