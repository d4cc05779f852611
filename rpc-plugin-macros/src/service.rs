use syn::{
    parenthesized,
    parse::{Parse, ParseStream},
    Ident, LitInt, LitStr, Result, Token, Type,
};

/// The body of `plugin_service!`.
pub struct ServiceDefinition {
    pub name: LitStr,
    pub service: Type,
    pub api_version: Option<(LitInt, LitInt)>,
}

impl Parse for ServiceDefinition {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name = None;
        let mut service = None;
        let mut api_version = None;

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            let _: Token![:] = input.parse()?;

            if key == "name" {
                if name.is_some() {
                    return Err(syn::Error::new(key.span(), "`name` is given twice"));
                }
                name = Some(input.parse()?);
            } else if key == "service" {
                if service.is_some() {
                    return Err(syn::Error::new(key.span(), "`service` is given twice"));
                }
                service = Some(input.parse()?);
            } else if key == "api_version" {
                if api_version.is_some() {
                    return Err(syn::Error::new(key.span(), "`api_version` is given twice"));
                }
                let content;
                parenthesized!(content in input);
                let major = content.parse()?;
                let _: Token![,] = content.parse()?;
                let minor = content.parse()?;
                api_version = Some((major, minor));
            } else {
                return Err(syn::Error::new(
                    key.span(),
                    "expected one of `name`, `service` or `api_version`",
                ));
            }

            if input.is_empty() {
                break;
            }
            let _: Token![,] = input.parse()?;
        }

        let name = name.ok_or_else(|| input.error("missing `name: \"...\"`"))?;
        let service = service.ok_or_else(|| input.error("missing `service: Type`"))?;
        Ok(Self {
            name,
            service,
            api_version,
        })
    }
}
