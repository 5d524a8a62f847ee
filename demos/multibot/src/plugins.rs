//! The demo's plugin catalog.

use std::sync::Arc;

use fleet::prelude::*;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StartConfig {
    #[serde(default = "default_greeting")]
    greeting: String,
}

fn default_greeting() -> String {
    "Hello!".to_string()
}

pub fn catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog
        .register(help())
        .register(start())
        .register(echo());
    catalog
}

fn help() -> PluginDescriptor {
    PluginDescriptor::new("help", |_ctx| {
        Ok(Plugin::builder("help")
            .matcher(on_command("help").handler(|ctx| async move {
                ctx.reply("/start - greeting\n/echo <text> - repeat text\n/help - this list")
                    .await
            }))
            .build())
    })
    .description("Lists available commands")
}

fn start() -> PluginDescriptor {
    PluginDescriptor::new("start", |ctx| {
        let config: StartConfig = ctx.get_config()?;
        let greeting: Arc<str> = config.greeting.into();
        Ok(Plugin::builder("start")
            .on_start(|ctx| async move {
                info!(bot_id = ctx.bot_id(), "Greeter ready");
                Ok(())
            })
            .matcher(on_command("start").handler(move |ctx| {
                let greeting = Arc::clone(&greeting);
                async move { ctx.reply(greeting.to_string()).await }
            }))
            .build())
    })
    .depends_on(["help"])
    .description("Greets users")
}

fn echo() -> PluginDescriptor {
    PluginDescriptor::new("echo", |_ctx| {
        Ok(Plugin::builder("echo")
            .matcher(on_command("echo").handler(|ctx| async move {
                let text = ctx.command().map(|(_, args)| args.to_string()).unwrap_or_default();
                ctx.reply(text).await
            }))
            .build())
    })
    .description("Repeats what it is told")
}
