// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Generate a [`ire::ddi::kstat::KStatProvider`] implementation
/// given a struct of named fields of type
/// [`ire::ddi::kstat::KStatU64`].
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct IreStats {
///     inserted: KStatU64,
///     deleted: KStatU64,
/// }
/// ```
///
/// This macro generates the following code based on the struct above.
///
/// ```ignore
/// #[derive(Clone, Debug, Deserialize, Serialize)]
/// pub struct IreStatsSnap {
///     pub inserted: u64,
///     pub deleted: u64,
/// }
///
/// impl IreStatsSnap {
///     pub fn fields(&self) -> [(&'static str, u64); 2] {
///         [("inserted", self.inserted), ("deleted", self.deleted)]
///     }
/// }
///
/// impl KStatProvider for IreStats {
///     const NUM_FIELDS: u32 = 2;
///     type Snap = IreStatsSnap;
///
///     fn init(&mut self) -> Result<(), kstat::Error> {
///         self.inserted.init("inserted")?;
///         self.deleted.init("deleted")?;
///         Ok(())
///     }
///
///     fn new() -> Self {
///         Self {
///             inserted: KStatU64::new(),
///             deleted: KStatU64::new(),
///         }
///     }
///
///     fn snapshot(&self) -> IreStatsSnap { ... }
/// }
/// ```
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let DeriveInput { ident, data, .. } = input;
    let span = ident.span();
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "a KStatProvider must have named fields",
                ));
            }
        },

        _ => {
            return Err(syn::Error::new(
                span,
                "only a struct may be a KStatProvider",
            ));
        }
    };

    let num_fields = fields.len() as u32;
    let num_usize = fields.len();
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    Ok(quote! {
        #[derive(Clone, Debug, ::serde::Deserialize, ::serde::Serialize)]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl #ident_snap {
            /// Each counter with its name, in declaration order.
            pub fn fields(&self) -> [(&'static str, u64); #num_usize] {
                [ #( (stringify!(#fields_ident), self.#fields_ident), )* ]
            }
        }

        impl ::ire::ddi::kstat::KStatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn init(
                &mut self
            ) -> core::result::Result<(), ::ire::ddi::kstat::Error> {
                #( self.#fields_ident.init(stringify!(#fields_ident))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::ire::ddi::kstat::KStatU64;

                Self {
                    #( #fields_ident: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }
        }
    })
}
