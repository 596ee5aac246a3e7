//!
//! +--------------+----------------------+-----------------------------+
//! | KeyPrefix::  | Key::                | Value::                     |
//! +--------------+----------------------+-----------------------------+
//! | 33           | Payment_hash         | Preimage                    |
//! +--------------+----------------------+-----------------------------+

pub const PREIMAGE_PREFIX: u8 = 33;
