pub mod agent_loop;
pub mod auth;
pub mod backoff;
pub mod client;
pub mod error;
pub mod events;
pub mod model_caller;
pub mod models;
pub mod routes;
pub mod rpc;
pub mod session;
pub mod store;
pub mod tools;

use auth::AuthProvider;
use events::EventBus;
use rocket_cors::CorsOptions;
use session::SessionRegistry;
use std::env;
use store::Store;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("AGORAI_DB").unwrap_or_else(|_| "data/bridge.db".to_string());
    let auth = match env::var("AGORAI_KEYS") {
        Ok(path) => AuthProvider::from_keyfile(&path).unwrap_or_else(|e| {
            eprintln!("⚠️  {e}");
            std::process::exit(1);
        }),
        Err(_) => {
            eprintln!("⚠️  AGORAI_KEYS not set; starting with an empty key set (no agent can authenticate)");
            AuthProvider::new(env::var("AGORAI_SALT").ok(), Vec::new())
        }
    };
    rocket_with_auth(&db_path, auth)
}

pub fn rocket_with_auth(db_path: &str, auth: AuthProvider) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let events = EventBus::new();
    let store = Store::new(db_path, events.clone());
    let sessions = SessionRegistry::new();

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    // Message content caps at 100 KB; leave headroom for the JSON-RPC envelope
    let figment = rocket::Config::figment().merge(("limits.json", 512 * 1024));

    rocket::custom(figment)
        .manage(store)
        .manage(events)
        .manage(auth)
        .manage(sessions)
        .attach(cors)
        .register("/", rocket::catchers![routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::mcp_post,
                routes::mcp_stream,
                routes::mcp_delete,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff("Bridge", |_rocket| {
            Box::pin(async move {
                println!("🌉 Agorai bridge ready on /mcp");
            })
        }))
}
