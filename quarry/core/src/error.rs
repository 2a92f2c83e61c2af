// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Quarry error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    result,
};

/// Result type alias for Quarry operations.
pub type Result<T> = result::Result<T, QuarryError>;

/// Quarry error types.
#[derive(Debug)]
pub enum QuarryError {
    /// General error with a descriptive message.
    General(String),
    /// Configuration error with invalid settings.
    Configuration(String),
}

impl From<String> for QuarryError {
    fn from(e: String) -> Self {
        QuarryError::General(e)
    }
}

impl Display for QuarryError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            QuarryError::General(desc) => write!(f, "General error: {desc}"),
            QuarryError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
        }
    }
}

impl Error for QuarryError {}
