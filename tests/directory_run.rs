use std::path::Path;

use pnn_coloc::config::RunConfig;
use pnn_coloc::data::source::{DetectionSource, DirectorySource};
use pnn_coloc::error::Issue;
use pnn_coloc::export::Exporter;
use pnn_coloc::stats::ChannelStatus;
use pnn_coloc::{run, run_with, CancelToken, Channel, ChannelPair, CombinationKind, SectionKey};

fn write(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn localization(root: &Path, channel_dir: &str, mouse: &str, folder: &str, body: &str) {
    let path = root
        .join(channel_dir)
        .join(mouse)
        .join(folder)
        .join(format!("localizations_{folder}.csv"));
    write(&path, body);
}

/// Two sections of one mouse; the second lacks Agg and has a bad WFA row.
fn build_tree(root: &Path) {
    localization(root, "Mice_WFA", "IB60", "IB60_CA1_1_WFA", "x,y\n10,10\n100,100\n");
    localization(root, "Mice_Agg", "IB60", "IB60_CA1_1_Agg", "x,y\n11,10\n300,300\n");
    localization(root, "PV_Mice", "IB60", "IB60_CA1_1_PV", "x,y\n10,12\n");

    localization(root, "Mice_WFA", "IB60", "IB60_CA1_2_WFA", "x,y\n0,0\nbad,1\n50,50\n");
    localization(root, "PV_Mice", "IB60", "IB60_CA1_2_PV", "X,Y\n3,4\n");
}

#[test]
fn end_to_end_directory_run() {
    let data = tempfile::tempdir().unwrap();
    build_tree(data.path());

    let source = DirectorySource::open(data.path()).unwrap();
    assert_eq!(
        source.sections(),
        vec![
            SectionKey::new("IB60", "IB60_CA1_1"),
            SectionKey::new("IB60", "IB60_CA1_2"),
        ]
    );

    let config = RunConfig {
        threshold: 5.0,
        emit_unmatched: true,
        ..Default::default()
    }
    .validate()
    .unwrap();
    let output = run(&source, &config, &CancelToken::new());
    let summary = &output.summary;

    let first = &summary.sections[0];
    assert_eq!(first.tally(CombinationKind::Triple).unwrap().groups, 1);

    let second = &summary.sections[1];
    assert_eq!(second.channel_status(Channel::Agg), Some(ChannelStatus::Missing));
    assert_eq!(second.channels[&Channel::Wfa].dropped, 1);
    let wfa_pv = second
        .tally(CombinationKind::Pair(ChannelPair::WFA_PV))
        .unwrap();
    assert_eq!(wfa_pv.groups, 1);
    assert_eq!(wfa_pv.percentage(), Some(100.0));

    // Ids are CSV line numbers: the malformed row is line 3.
    let result = &output.results[1];
    let ids: Vec<usize> = result.channels[&Channel::Wfa]
        .detections()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![2, 4]);

    assert!(summary.issues.iter().any(|i| matches!(
        i,
        Issue::MalformedRecords { channel: Channel::Wfa, first_rows, .. } if first_rows == &vec![3]
    )));
    assert_eq!(summary.partial_sections().count(), 1);

    // Aggregates add up the raw counts of both sections.
    let totals = summary
        .totals
        .tally(CombinationKind::Pair(ChannelPair::WFA_PV))
        .unwrap();
    assert_eq!(totals.evaluated, 2);
    assert_eq!(totals.channel_totals[&Channel::Wfa], 4);
    assert_eq!(totals.channel_totals[&Channel::Pv], 2);
    // Section 1's WFA-PV match was absorbed into the triple.
    assert_eq!(totals.groups, 1);
    assert_eq!(totals.percentage(), Some(50.0));

    let out = tempfile::tempdir().unwrap();
    let exporter = Exporter::new(out.path(), &config).unwrap();
    let streamed = run_with(&source, &config, &CancelToken::new(), |r| {
        exporter.write_section(&r)
    })
    .unwrap();
    assert_eq!(&streamed, summary);
    exporter.write_run(&streamed).unwrap();
    for file in ["sections.csv", "mice.csv", "totals.csv", "issues.csv", "run_summary.json"] {
        assert!(out.path().join(file).is_file(), "{file} missing");
    }
    let section_dir = out.path().join("IB60").join("IB60_CA1_2");
    assert!(section_dir.join("groups.csv").is_file());
    assert!(section_dir.join("unmatched.csv").is_file());
}

#[test]
fn invalid_threshold_aborts_before_work() {
    let config = RunConfig {
        threshold: -1.0,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}
