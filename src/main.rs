// src/main.rs
use actix::Actor;
use actix_web::{App, HttpServer, middleware, web};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use maize_shop::api::helpers::MAX_BODY_BYTES;
use maize_shop::api::stripe_client::StripeClient;
use maize_shop::config::Config;
use maize_shop::db::{self, PgStore};
use maize_shop::mailer::LogMailer;
use maize_shop::ws::WsHub;
use maize_shop::{AppState, api, docs};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let cfg = Config::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let pool = db::connect(&cfg.dsn, cfg.db_timeout())
        .await
        .map_err(std::io::Error::other)?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(std::io::Error::other)?;

    let gateway = StripeClient::new(
        &cfg.stripe_api_base,
        cfg.gateway_timeout(),
        cfg.gateway_retries,
    )
    .map_err(std::io::Error::other)?;

    let state = web::Data::new(AppState {
        store: Arc::new(PgStore::new(pool, cfg.db_timeout())),
        gateway: Arc::new(gateway),
        mailer: Arc::new(LogMailer {
            from: cfg.mail_from.clone(),
        }),
        ws_hub: WsHub::new().start(),
        stripe_secret: cfg.stripe_secret.clone(),
        frontend_url: cfg.frontend_url.clone(),
    });

    log::info!("starting backend server in {} mode on port {}", cfg.env, cfg.port);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            .configure(api::configure)
    })
    .bind(("0.0.0.0", cfg.port))?
    .run()
    .await
}
