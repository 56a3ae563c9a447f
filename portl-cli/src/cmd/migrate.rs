use serde::Serialize;

use portl_store::{run_migrations, PgOutboxStore};

use crate::exit_codes;
use crate::output::{print_error, print_result, OutputFormat};
use crate::utils::redact_url_password;
use crate::{DatabaseArgs, OutputArgs};

use super::config::get_database_url;

#[derive(Serialize)]
struct MigrateResult {
    success: bool,
    message: String,
}

pub async fn migrate_cmd(database: DatabaseArgs, output: OutputArgs) -> i32 {
    let database_url = match get_database_url(database.database_url, &output) {
        Some(v) => v,
        None => return exit_codes::RUNTIME_ERROR,
    };

    let store = match PgOutboxStore::connect(&database_url, database.max_connections).await {
        Ok(s) => s,
        Err(e) => {
            print_error(
                output.format,
                output.quiet,
                &format!("failed to connect to {}: {e}", redact_url_password(&database_url)),
            );
            return exit_codes::RUNTIME_ERROR;
        }
    };

    match run_migrations(store.pool()).await {
        Ok(()) => {
            let result = MigrateResult {
                success: true,
                message: "migrations applied".to_string(),
            };
            if output.format == OutputFormat::Text && !output.quiet {
                println!("ok: migrations applied");
            } else {
                print_result(output.format, output.quiet, &result);
            }
            exit_codes::SUCCESS
        }
        Err(e) => {
            print_error(output.format, output.quiet, &e.to_string());
            exit_codes::RUNTIME_ERROR
        }
    }
}
