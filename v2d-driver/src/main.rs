// Vintage2D command stream replay
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

mod backend;

fn main() {
    backend::v2d_init()
}
