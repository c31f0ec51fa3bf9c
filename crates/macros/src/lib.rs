use proc_macro::TokenStream;
use quote::quote;
use syn::{parse::Parse, parse::ParseStream, parse_macro_input, DeriveInput, Expr, ExprArray, Ident, LitStr, Token};

/// Parsed `#[kora_plugin(...)]` attribute
struct PluginAttr {
    id: String,
    name: String,
    description: String,
    version: String,
    capabilities: Vec<String>,
    dependencies: Vec<String>,
    config_keys: Vec<String>,
    tools: Vec<String>,
}

impl Parse for PluginAttr {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut attr = PluginAttr {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            version: String::from("0.1.0"),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            config_keys: Vec::new(),
            tools: Vec::new(),
        };

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            if input.peek(LitStr) {
                let val: LitStr = input.parse()?;
                match key.to_string().as_str() {
                    "id" => attr.id = val.value(),
                    "name" => attr.name = val.value(),
                    "description" => attr.description = val.value(),
                    "version" => attr.version = val.value(),
                    other => {
                        return Err(syn::Error::new_spanned(
                            &key,
                            format!("unknown kora_plugin key '{}'", other),
                        ))
                    }
                }
            } else if input.peek(syn::token::Bracket) {
                let content: ExprArray = input.parse()?;
                let vals: Vec<String> = content
                    .elems
                    .iter()
                    .filter_map(|e| {
                        if let Expr::Lit(syn::ExprLit { lit: syn::Lit::Str(s), .. }) = e {
                            Some(s.value())
                        } else {
                            None
                        }
                    })
                    .collect();

                match key.to_string().as_str() {
                    "capabilities" => attr.capabilities = vals,
                    "dependencies" => attr.dependencies = vals,
                    "config_keys" => attr.config_keys = vals,
                    "tools" => attr.tools = vals,
                    other => {
                        return Err(syn::Error::new_spanned(
                            &key,
                            format!("unknown kora_plugin list '{}'", other),
                        ))
                    }
                }
            } else {
                return Err(input.error("expected a string literal or a list of string literals"));
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(attr)
    }
}

/// Generates the descriptor, a factory and the inventory registration for a
/// compiled-in plugin. The type must provide
/// `async fn new_plugin(config: kora_shared::PluginConfig) -> anyhow::Result<Self>`.
#[proc_macro_attribute]
pub fn kora_plugin(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    let attr = parse_macro_input!(attr as PluginAttr);

    match emit_plugin_code(input, attr) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(err) => err.to_compile_error().into(),
    }
}

fn emit_plugin_code(input: DeriveInput, attr: PluginAttr) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    if attr.id.is_empty() {
        return Err(syn::Error::new_spanned(&input.ident, "Plugin 'id' is required"));
    }
    if attr.name.is_empty() {
        return Err(syn::Error::new_spanned(&input.ident, "Plugin 'name' is required"));
    }
    if attr.capabilities.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "Plugin must declare at least one capability",
        ));
    }

    let factory_name = quote::format_ident!("{}Factory", name);
    let id_str = &attr.id;
    let name_str = &attr.name;
    let description_str = &attr.description;
    let version_str = &attr.version;
    let caps = attr.capabilities.iter().map(|c| quote! { #c.to_string() });
    let deps = attr.dependencies.iter().map(|d| quote! { #d.to_string() });
    let keys = attr.config_keys.iter().map(|k| quote! { #k.to_string() });
    let tools = attr
        .tools
        .iter()
        .map(|t| quote! { kora_shared::ToolSpec::new(#t, "") });

    Ok(quote! {
        #input

        impl #name {
            pub const PLUGIN_ID: &'static str = #id_str;

            pub fn factory() -> std::sync::Arc<dyn kora_shared::PluginFactory> {
                std::sync::Arc::new(#factory_name)
            }

            /// Descriptor generated from the `kora_plugin` attribute.
            pub fn static_descriptor() -> kora_shared::PluginDescriptor {
                kora_shared::PluginDescriptor {
                    id: Self::PLUGIN_ID.to_string(),
                    name: #name_str.to_string(),
                    version: #version_str.to_string(),
                    description: #description_str.to_string(),
                    kind: kora_shared::PluginKind::Builtin,
                    capabilities: vec![ #(#caps),* ],
                    dependencies: vec![ #(#deps),* ],
                    provided_tools: vec![ #(#tools),* ],
                    default_config: kora_shared::ConfigMap::new(),
                    required_config_keys: vec![ #(#keys),* ],
                }
            }
        }

        pub struct #factory_name;

        #[async_trait::async_trait]
        impl kora_shared::PluginFactory for #factory_name {
            fn name(&self) -> &str { #id_str }

            fn descriptor(&self) -> kora_shared::PluginDescriptor {
                #name::static_descriptor()
            }

            async fn create(&self, config: kora_shared::PluginConfig) -> anyhow::Result<std::sync::Arc<dyn kora_shared::Plugin>> {
                let plugin = #name::new_plugin(config).await?;
                Ok(std::sync::Arc::new(plugin))
            }
        }

        kora_shared::inventory::submit! {
            kora_shared::PluginRegistrar {
                factory: #name::factory,
            }
        }
    })
}
