/*!
# csbench command

`csbench` executes the specified commands repeatedly under stop policies,
measures wall-clock time, resource usage, optional hardware performance
counters and custom metrics parsed from captured stdout, and reports
bootstrap-resampled estimates with confidence intervals.

## Basic benchmarks

```sh
csbench 'sleep 0.1'
```

Adaptive sampling runs the command until the time limit (default 5 s) is
reached; `-R` pins an exact run count instead:

```sh
csbench 'sleep 0.1' -R 20 --no-warmup
```

## Compare commands

```sh
csbench 'grep -c x file' 'rg -c x file'
```

Each command is measured separately; the report ends with a speed
comparison against the fastest (or the `--baseline` of your choice),
including Mann-Whitney and bootstrapped Welch t p-values.

## Parameter scans

```sh
csbench 'echo {n} | ./quicksort.py' --scan n/100/500/100 --custom t
```

One benchmark per value of `n`; per-group results include a least-squares
complexity fit over the scanned values.

## Exports

`--json FILE` writes settings and raw samples as JSON; `--csv` writes the
raw/stats/group CSV family into the output directory (default
`./.csbench`). `csbench load [DIR]` re-analyzes those artifacts without
executing anything.
*/
fn main() {
    let res = csbench_lib::app::run();
    proc_exit::exit(res);
}
