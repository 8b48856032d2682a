// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Transparent IPv4 -> IPv6 TLS proxy.
//!
//! Connections are routed by the server name in the client's TLS ClientHello.
//! The name is checked against the allow rules, resolved to an IPv6
//! destination, checked against the deny rules, and the connection is then
//! relayed byte for byte. TLS is never terminated.

pub mod config;
pub mod policy;
pub mod proxy;
pub mod resolve;
pub mod sni;
pub mod source;

pub use config::{Config, ConfigError};
pub use proxy::{ConnectionContext, Proxy, RouteError};
pub use resolve::{Resolver, SystemResolver};
