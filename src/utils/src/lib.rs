// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod mem;
mod range;
mod sys_error;

pub use range::*;
pub use sys_error::*;
