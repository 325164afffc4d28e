use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Data, DeriveInput, Error, Fields, GenericArgument, Ident, Index, Member, PathArguments, Type,
    TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `Node` trait.
///
/// This macro generates an implementation of `Node` that hands the queue the
/// struct's embedded `Link` field.
///
/// # Compile-Time Checks
///
/// The macro enforces the following requirements:
///
/// 1. **Struct only**: enums and unions cannot carry a single stable link.
///
/// 2. **Exactly one link**: the struct must have exactly one field whose type
///    is `Link<..>` (optionally path-qualified, e.g. `linkq::Link<..>`).
///
/// 3. **Self-referential link**: the link must be parameterized by the node
///    type itself, written either as `Link<Self>` or `Link<TypeName>`.
///
/// The generated `link` returns a reference to that field, which is the
/// storage the queue performs its atomic operations on.
///
/// # Example
///
/// ```
/// # use linkq::{Link, Node};
/// #[derive(Node)]
/// struct Waiter {
///     link: Link<Self>,
///     id: u64,
/// }
/// ```
///
/// # Compile Errors
///
/// ```compile_fail
/// # use linkq::Node;
/// #[derive(Node)]
/// struct NoLink {  // Error: needs a `Link<Self>` field
///     id: u64,
/// }
/// ```
///
/// ```compile_fail
/// # use linkq::{Link, Node};
/// struct Other;
///
/// #[derive(Node)]
/// struct WrongLink {
///     link: Link<Other>,  // Error: must be Link<Self>
/// }
/// ```
#[proc_macro_derive(Node)]
pub fn derive_node(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_node_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn get_crate_path() -> proc_macro2::TokenStream {
    match crate_name("linkq") {
        Ok(FoundCrate::Itself) => {
            quote!(::linkq)
        }
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Err(_) => {
            quote!(::linkq)
        }
    }
}

fn derive_node_impl(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let member = find_link_field(&input)?;

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let crate_path = get_crate_path();

    Ok(quote! {
        // SAFETY: `link` returns a field embedded in `self`.
        unsafe impl #impl_generics #crate_path::Node for #name #ty_generics #where_clause {
            #[inline]
            fn link(&self) -> &#crate_path::Link<Self> {
                &self.#member
            }
        }
    })
}

/// Locates the single `Link<Self>` field and returns how to access it.
fn find_link_field(input: &DeriveInput) -> syn::Result<Member> {
    let fields = match &input.data {
        Data::Struct(data_struct) => &data_struct.fields,
        Data::Enum(e) => {
            return Err(Error::new(
                e.enum_token.span,
                "Node can only be derived for structs",
            ));
        }
        Data::Union(u) => {
            return Err(Error::new(
                u.union_token.span,
                "Node can only be derived for structs",
            ));
        }
    };

    let mut found: Option<Member> = None;

    let members: Vec<(Member, &Type)> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .filter_map(|f| f.ident.clone().map(|ident| (Member::Named(ident), &f.ty)))
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, f)| (Member::Unnamed(Index::from(i)), &f.ty))
            .collect(),
        Fields::Unit => Vec::new(),
    };

    for (member, ty) in members {
        let Some(arg) = link_argument(ty) else {
            continue;
        };
        check_self_argument(arg, &input.ident)?;

        if found.is_some() {
            return Err(Error::new(
                ty.span(),
                "Node requires exactly one `Link` field, found more than one\n\
                 help: a node can only sit in one queue through this trait",
            ));
        }
        found = Some(member);
    }

    found.ok_or_else(|| {
        Error::new(
            input.ident.span(),
            "Node requires a field of type `Link<Self>`\n\
             help: add `link: Link<Self>` to this struct",
        )
    })
}

/// Returns the type argument if `ty` is `Link<..>`.
fn link_argument(ty: &Type) -> Option<&Type> {
    let Type::Path(TypePath { qself: None, path }) = ty else {
        return None;
    };
    let segment = path.segments.last()?;
    if segment.ident != "Link" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    })
}

fn check_self_argument(arg: &Type, name: &Ident) -> syn::Result<()> {
    if let Type::Path(TypePath { qself: None, path }) = arg
        && let Some(ident) = path.get_ident()
        && (ident == "Self" || ident == name)
    {
        return Ok(());
    }

    Err(Error::new(
        arg.span(),
        format!(
            "`Link` field must be parameterized by the node type itself.\n\
             help: use `Link<Self>` or `Link<{name}>`",
        ),
    ))
}
