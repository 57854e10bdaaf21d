//! # Commands Module
//!
//! Handlers behind the `bastion` subcommands:
//!
//! ## `serve`
//! Runs the backup server:
//! - Opens (or creates) the registry database and storage directory
//! - Accepts connections and runs one transfer session per connection
//! - Rejects connections beyond the session limit
//!
//! ## `backup`
//! Backs up one file as a client identity:
//! - Loads the identity's RSA key, generating it on first use
//! - Encrypts the file chunk by chunk and streams it to the server
//! - Prints the verification result reported by the server
//!
//! ## `admin`
//! The management verbs (`files`, `verify`, `delete`, `delete-client`):
//! - Go through the live or mock backend
//! - Print the result envelope as JSON

pub mod admin;
pub mod backup;
pub mod serve;
