//! Passes cloud settings from `.env` (or the environment) to the firmware as
//! compile-time variables.

const CLOUD_VARS: [&str; 3] = ["FIREBASE_API_KEY", "FIREBASE_DATABASE_URL", "FIREBASE_PATH"];

fn main() {
    // A missing .env is fine; the variables may come from the environment.
    let _ = dotenvy::dotenv();

    println!("cargo:rerun-if-changed=.env");
    for name in CLOUD_VARS {
        println!("cargo:rerun-if-env-changed={name}");
        match std::env::var(name) {
            Ok(value) => println!("cargo:rustc-env={name}={value}"),
            Err(_) => println!("cargo:warning={name} is not set; cloud uploads will be rejected"),
        }
    }

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
