use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Expr, Lit, LitStr, MetaNameValue, Result, Token, parse_macro_input};

pub(crate) fn expand(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);

    match expand_derive(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_derive(input: &DeriveInput) -> Result<proc_macro2::TokenStream> {
    if let Data::Union(u) = &input.data {
        return Err(syn::Error::new(
            u.union_token.span(),
            "#[derive(PublishableMessage)] can only be used on structs and enums",
        ));
    }

    let cfg = parse_message_attr(input)?;
    check_event_name(&cfg.event)?;
    if cfg.channel.value().is_empty() {
        return Err(syn::Error::new(cfg.channel.span(), "channel cannot be empty"));
    }

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let event = &cfg.event;
    let channel = &cfg.channel;

    Ok(quote! {
        impl #impl_generics ::evstream::publisher::PublishableMessage for #ident #ty_generics #where_clause {
            fn event_type(&self) -> &str { #event }
            fn channel(&self) -> &str { #channel }
        }

        impl #impl_generics #ident #ty_generics #where_clause {
            pub const EVENT_TYPE: &'static str = #event;
            pub const CHANNEL: &'static str = #channel;
        }
    })
}

// -------- parsing --------

struct MessageAttrConfig {
    event: LitStr,
    channel: LitStr,
}

fn parse_message_attr(input: &DeriveInput) -> Result<MessageAttrConfig> {
    let mut event: Option<LitStr> = None;
    let mut channel: Option<LitStr> = None;

    for attr in input.attrs.iter().filter(|a| a.path().is_ident("message")) {
        let pairs = attr.parse_args_with(Punctuated::<MetaNameValue, Token![,]>::parse_terminated)?;

        for kv in pairs {
            let key = kv
                .path
                .get_ident()
                .map(|i| i.to_string())
                .unwrap_or_default();
            let slot = match key.as_str() {
                "event" => &mut event,
                "channel" => &mut channel,
                _ => {
                    return Err(syn::Error::new(
                        kv.path.span(),
                        "unknown key; expected 'event' | 'channel'",
                    ));
                }
            };
            if slot.is_some() {
                return Err(syn::Error::new(
                    kv.path.span(),
                    format!("duplicate key '{key}' in attribute"),
                ));
            }
            let lit = match kv.value {
                Expr::Lit(syn::ExprLit {
                    lit: Lit::Str(lit), ..
                }) => lit,
                other => {
                    return Err(syn::Error::new(
                        other.span(),
                        format!("expected string literal for '{key}'"),
                    ));
                }
            };
            *slot = Some(lit);
        }
    }

    match (event, channel) {
        (Some(event), Some(channel)) => Ok(MessageAttrConfig { event, channel }),
        (None, _) => Err(syn::Error::new(
            input.ident.span(),
            "missing #[message(event = \"...\")]",
        )),
        (_, None) => Err(syn::Error::new(
            input.ident.span(),
            "missing #[message(channel = \"...\")]",
        )),
    }
}

/// 与运行时 `validate_event_name` 相同的命名规则
fn check_event_name(lit: &LitStr) -> Result<()> {
    let name = lit.value();
    let reason = if name.is_empty() {
        Some("event name cannot be empty")
    } else if !name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        Some("event name must match the regex ^[A-Z_]+$")
    } else if name.ends_with("_EVENT") {
        Some("event name must not end with '_EVENT'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(syn::Error::new(
            lit.span(),
            format!("invalid event name '{name}': {reason}"),
        )),
        None => Ok(()),
    }
}
