use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, Path, parse_macro_input, spanned::Spanned};

/// Derives the boilerplate of a configuration newtype that carries a default value.
///
/// The struct must be a tuple struct with exactly one field and must be annotated with
/// `#[wrapper_default_value(CONST)]`, where `CONST` is a path to a constant of the wrapped type.
/// The following implementations are generated:
/// - [Default], returning the wrapped constant.
/// - [From] in both directions between the wrapper and the wrapped type.
/// - [AsRef] to borrow the wrapped value.
#[proc_macro_derive(WrapperWithDefault, attributes(wrapper_default_value))]
pub fn wrapper_with_default(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> Result<proc_macro2::TokenStream, Error> {
    let wrapper = &input.ident;

    let default_value: Path = input
        .attrs
        .iter()
        .find(|attr| attr.path().is_ident("wrapper_default_value"))
        .ok_or_else(|| {
            Error::new(
                wrapper.span(),
                "missing `#[wrapper_default_value(CONST)]` attribute",
            )
        })?
        .parse_args()?;

    let Data::Struct(data) = &input.data else {
        return Err(Error::new(
            wrapper.span(),
            "WrapperWithDefault can only be derived for structs",
        ));
    };
    let Fields::Unnamed(fields) = &data.fields else {
        return Err(Error::new(
            data.fields.span(),
            "WrapperWithDefault requires a tuple struct",
        ));
    };
    let mut fields = fields.unnamed.iter();
    let (Some(field), None) = (fields.next(), fields.next()) else {
        return Err(Error::new(
            data.fields.span(),
            "WrapperWithDefault requires exactly one field",
        ));
    };
    let wrapped = &field.ty;

    Ok(quote! {
        impl ::core::default::Default for #wrapper {
            fn default() -> Self {
                Self(#default_value)
            }
        }

        impl ::core::convert::From<#wrapped> for #wrapper {
            fn from(value: #wrapped) -> Self {
                Self(value)
            }
        }

        impl ::core::convert::From<#wrapper> for #wrapped {
            fn from(value: #wrapper) -> Self {
                value.0
            }
        }

        impl ::core::convert::AsRef<#wrapped> for #wrapper {
            fn as_ref(&self) -> &#wrapped {
                &self.0
            }
        }
    })
}
