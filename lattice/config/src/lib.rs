// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod parameters;

pub use parameters::{
    BusParameters, Parameters, RegistryInitParameters, RegistryParameters, ScalingRules,
    TimerParameters, WorkerPoolParameters,
};
